#![forbid(unsafe_code)]

use parley_client_core::{
	CatchUpTracker, ClientConfig, DEFAULT_SERVER_ENDPOINT_QUIC, EventDisposition, SessionControl, new_idempotency_token,
};
use parley_protocol::pb;
use tracing::{info, warn};

const CREDENTIAL_ENV: &str = "PARLEY_CLIENT_CREDENTIAL";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_client [--connect quic://host:port] [--list] [--conversation id]... [--say text]\n\
\n\
Options:\n\
	--connect       Server endpoint (default: quic://127.0.0.1:18300)\n\
	--list          Print conversation summaries and exit\n\
	--conversation  Conversation to follow (repeatable)\n\
	--say           Send text to the first conversation after subscribing\n\
	--help          Show this help\n\
\n\
The credential is read from {CREDENTIAL_ENV}.\n"
	);
	std::process::exit(2)
}

struct Args {
	cfg: ClientConfig,
	list: bool,
	conversations: Vec<String>,
	say: Option<String>,
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();
	let mut list = false;
	let mut conversations = Vec::new();
	let mut say = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => endpoint = it.next().unwrap_or_else(|| usage_and_exit()),
			"--list" => list = true,
			"--conversation" => {
				let c = it.next().unwrap_or_else(|| usage_and_exit());
				if c.trim().is_empty() {
					eprintln!("--conversation must be non-empty");
					usage_and_exit();
				}
				conversations.push(c);
			}
			"--say" => say = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let mut cfg = ClientConfig::from_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {endpoint}\n{e}");
		usage_and_exit();
	});
	cfg.client_name = format!("parley-client-cli/{}", env!("CARGO_PKG_VERSION"));
	cfg.client_instance_id = format!("cli-{}", std::process::id());
	cfg.credential = std::env::var(CREDENTIAL_ENV)
		.map(|v| v.trim().to_string())
		.unwrap_or_default();

	if !list && conversations.is_empty() {
		eprintln!("nothing to do: pass --list or at least one --conversation");
		usage_and_exit();
	}

	Args {
		cfg,
		list,
		conversations,
		say,
	}
}

fn print_event(ev: &pb::Event) {
	match ev.kind.as_ref() {
		Some(pb::event::Kind::Message(m)) if m.deleted => println!("[{} #{}] <deleted>", ev.conversation_id, m.seq),
		Some(pb::event::Kind::Message(m)) => println!("[{} #{}] {}: {}", ev.conversation_id, m.seq, m.sender_id, m.content),
		Some(pb::event::Kind::CaughtUp(c)) => println!("[{}] caught up at #{}", ev.conversation_id, c.head_seq),
		Some(pb::event::Kind::MessageDeleted(d)) => println!("[{} #{}] deleted", ev.conversation_id, d.seq),
		Some(pb::event::Kind::Presence(p)) => {
			println!("{} is {}", p.user_id, if p.online { "online" } else { "offline" })
		}
		None => warn!(conversation_id = %ev.conversation_id, "empty event"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	info!(server = %args.cfg.server_host, port = args.cfg.server_port, "connecting");
	let (mut control, welcome) = SessionControl::connect(args.cfg).await?;
	info!(user_id = %welcome.user_id, server = %welcome.server_name, "session established");

	if args.list {
		for summary in control.list_all_conversations(50, "").await? {
			let Some(info) = summary.info else {
				continue;
			};
			let names: Vec<_> = info.members.iter().map(|m| m.display_name.as_str()).collect();
			println!(
				"{} [{}] {} unread={} members={}",
				info.id,
				info.kind,
				info.title.as_deref().unwrap_or("-"),
				summary.unread_count,
				names.join(", ")
			);
		}
		if args.conversations.is_empty() {
			control.close(0, "done");
			return Ok(());
		}
	}

	let mut tracker = CatchUpTracker::new();
	for c in &args.conversations {
		tracker.track(c.clone(), 0);
	}
	let subscribed = control.subscribe(tracker.resume_points()).await?;
	for r in &subscribed.results {
		info!(conversation_id = %r.conversation_id, status = r.status, head_seq = r.head_seq, "subscription");
	}
	let mut events = control.open_events_stream().await?;

	if let (Some(text), Some(conversation)) = (args.say.as_deref(), args.conversations.first()) {
		let sent = control.send_message(conversation, text, &new_idempotency_token()).await?;
		info!(seq = sent.seq, "sent");
	}

	// Keep the control stream busy so the server's idle reaper leaves us alone.
	let pinger = tokio::spawn(async move {
		let mut tick = tokio::time::interval(std::time::Duration::from_secs(20));
		loop {
			tick.tick().await;
			if let Err(e) = control.ping(0).await {
				warn!(error = %e, "ping failed");
				return;
			}
		}
	});

	let result = events
		.run_events_loop(|ev| {
			if tracker.observe(&ev) != EventDisposition::Duplicate {
				print_event(&ev);
			}
		})
		.await;

	pinger.abort();
	result?;
	Ok(())
}
