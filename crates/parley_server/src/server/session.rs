#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use futures::StreamExt;
use parley_domain::{Conversation, ConversationId, IdempotencyToken, PresenceSnapshot, Seq, UserId, UserProfile};
use parley_protocol::convert::{
	envelope, error_envelope, error_envelope_with_detail, event_envelope, presence_state, response_envelope,
};
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameCodec, pb};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::fanout::FanoutEvent;
use crate::server::gateway::{
	CatchUpFeed, CatchUpItem, ConnectionHandle, ConversationView, Gateway, GatewayError, SendAccepted, SendRejection,
	SubscriptionInfo,
};
use crate::util::time::unix_ms_now;

/// Application close code: the outbound queue overflowed or the connection idled out.
pub const CLOSE_EVICTED: u32 = 1;
/// Application close code: the peer broke the stream protocol.
pub const CLOSE_PROTOCOL_ERROR: u32 = 2;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub server_name: String,
	pub max_frame_bytes: u32,
	/// How long the client has to open the events stream after its first subscribe.
	pub events_stream_timeout: Duration,
	pub default_page_size: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			server_name: "parley".to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			events_stream_timeout: Duration::from_secs(10),
			default_page_size: 50,
		}
	}
}

enum EventsCommand {
	Attach(quinn::SendStream),
	Subscribe {
		conversation: ConversationId,
		after_seq: Seq,
		reply: oneshot::Sender<Result<SubscriptionInfo, GatewayError>>,
	},
}

pub async fn handle_connection(
	transport_id: u64,
	connection: quinn::Connection,
	gateway: Gateway,
	settings: SessionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let codec = FrameCodec::new(settings.max_frame_bytes as usize);
	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("parley_server_control_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match codec.try_decode::<pb::Envelope>(&mut buf) {
					Ok(Some(msg)) => {
						metrics::counter!("parley_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("parley_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let auth_timeout = gateway.config().auth_timeout;
	let hello = match tokio::time::timeout(auth_timeout, wait_for_hello(&mut ctrl_rx)).await {
		Ok(hello) => hello?,
		Err(_) => {
			info!(transport_id, "no Hello before auth timeout");
			refuse(&mut control_send, &codec, "hello not received in time").await;
			reader_task.abort();
			return Ok(());
		}
	};

	let connected = match gateway.connect(&hello.credential).await {
		Ok(c) => c,
		Err(e) => {
			metrics::counter!("parley_server_auth_failures_total").increment(1);
			info!(transport_id, client_name = %hello.client_name, error = %e, "authentication failed");
			refuse(&mut control_send, &codec, &e.to_string()).await;
			reader_task.abort();
			return Ok(());
		}
	};
	let handle = connected.handle.clone();

	info!(
		transport_id,
		conn_id = %handle.conn_id,
		user_id = %handle.user_id,
		client_name = %hello.client_name,
		client_instance_id = %hello.client_instance_id,
		remote = %connection.remote_address(),
		"session established"
	);

	send_envelope(
		&mut control_send,
		&codec,
		envelope(
			String::new(),
			pb::envelope::Msg::Welcome(pb::Welcome {
				server_name: settings.server_name.clone(),
				user_id: handle.user_id.to_string(),
				connection_id: handle.conn_id.0,
				server_time_unix_ms: unix_ms_now(),
				max_frame_size: settings.max_frame_bytes,
				max_content_code_points: gateway.config().max_content_code_points as u32,
			}),
		),
	)
	.await?;

	let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<EventsCommand>();
	let events_task = {
		let gateway = gateway.clone();
		let handle = handle.clone();
		let connection = connection.clone();
		tokio::spawn(async move {
			let result = run_events(
				&gateway,
				&handle,
				connected.events,
				connected.closed,
				cmd_rx,
				codec,
				&connection,
			)
			.await;
			if let Err(e) = &result {
				warn!(conn_id = %handle.conn_id, error = %e, "events stream failed");
				connection.close(quinn::VarInt::from_u32(CLOSE_PROTOCOL_ERROR), b"events stream failed");
			}
			result
		})
	};

	let mut events_attached = false;
	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			if !gateway.heartbeat(&handle) {
				info!(conn_id = %handle.conn_id, "connection reaped; closing session");
				connection.close(quinn::VarInt::from_u32(CLOSE_EVICTED), b"idle");
				break;
			}

			let Some(msg) = env.msg else { continue };
			match msg {
				pb::envelope::Msg::Ping(_) => {
					send_envelope(
						&mut control_send,
						&codec,
						envelope(
							env.request_id,
							pb::envelope::Msg::Pong(pb::Pong {
								server_time_unix_ms: unix_ms_now(),
							}),
						),
					)
					.await?;
				}

				pb::envelope::Msg::Request(req) => {
					let is_subscribe = matches!(req.kind, Some(pb::request::Kind::Subscribe(_)));
					let reply = match req.kind {
						Some(kind) => match handle_request(&gateway, &handle, &settings, &cmd_tx, kind).await {
							Ok(kind) => response_envelope(env.request_id, kind),
							Err(e) => request_error(env.request_id, &handle, &e),
						},
						None => error_envelope(env.request_id, pb::ErrorCode::InvalidRequest, "request without kind"),
					};
					send_envelope(&mut control_send, &codec, reply).await?;

					if is_subscribe && !events_attached {
						debug!(conn_id = %handle.conn_id, "waiting for client-opened events stream");
						let (send, _recv) = tokio::time::timeout(settings.events_stream_timeout, connection.accept_bi())
							.await
							.map_err(|_| anyhow!("events stream not opened in time"))?
							.context("accept events bidirectional stream")?;
						info!(conn_id = %handle.conn_id, "accepted events bidirectional stream (server will only write)");
						events_attached = true;
						if cmd_tx.send(EventsCommand::Attach(send)).is_err() {
							break;
						}
					}
				}

				pb::envelope::Msg::Hello(_) => {
					debug!(conn_id = %handle.conn_id, "ignoring duplicate Hello");
				}

				other => {
					warn!(conn_id = %handle.conn_id, "unhandled control message: {:?}", other);
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	// Commands close before `disconnect` fires the drop signal.
	drop(cmd_tx);
	gateway.disconnect(&handle);

	let _ = reader_task.await;
	let _ = events_task.await;

	loop_result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

/// Send UNAUTHORIZED and give the peer a moment to read it before the connection drops.
async fn refuse(send: &mut quinn::SendStream, codec: &FrameCodec, reason: &str) {
	let env = error_envelope(String::new(), pb::ErrorCode::Unauthorized, reason);
	if send_envelope(send, codec, env).await.is_ok() {
		let _ = send.finish();
		let _ = tokio::time::timeout(Duration::from_secs(1), send.stopped()).await;
	}
}

async fn send_envelope(send: &mut quinn::SendStream, codec: &FrameCodec, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = codec.encode(&env).map_err(|e| anyhow!(e))?;
	metrics::counter!("parley_server_envelopes_out_total").increment(1);
	metrics::counter!("parley_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

/// Owns the events stream: catch-up first, then live fanout, deduplicated by seq.
///
/// Closes the connection as soon as the gateway drops it, with or without an
/// attached stream, and without flushing what is still queued.
async fn run_events(
	gateway: &Gateway,
	handle: &ConnectionHandle,
	mut events: mpsc::Receiver<FanoutEvent>,
	mut closed: oneshot::Receiver<()>,
	mut commands: mpsc::UnboundedReceiver<EventsCommand>,
	codec: FrameCodec,
	connection: &quinn::Connection,
) -> anyhow::Result<()> {
	let mut sink: Option<quinn::SendStream> = None;
	let mut pending: VecDeque<(ConversationId, CatchUpFeed)> = VecDeque::new();
	// Highest seq written per conversation.
	let mut delivered: HashMap<ConversationId, Seq> = HashMap::new();

	loop {
		if let Some(send) = sink.as_mut() {
			while let Some((conversation, feed)) = pending.pop_front() {
				write_catch_up(send, &codec, &conversation, feed, &mut delivered).await?;
			}
		}

		tokio::select! {
			biased;

			cmd = commands.recv() => match cmd {
				None => return Ok(()),
				Some(EventsCommand::Attach(send)) => sink = Some(send),
				Some(EventsCommand::Subscribe { conversation, after_seq, reply }) => {
					match open_subscription(gateway, handle, &conversation, after_seq).await {
						Ok((info, feed)) => {
							delivered.insert(conversation.clone(), after_seq);
							pending.push_back((conversation, feed));
							let _ = reply.send(Ok(info));
						}
						Err(e) => {
							let _ = reply.send(Err(e));
						}
					}
				}
			},

			_ = &mut closed => {
				info!(conn_id = %handle.conn_id, "connection dropped by gateway (evicted or reaped); closing");
				connection.close(quinn::VarInt::from_u32(CLOSE_EVICTED), b"evicted");
				return Ok(());
			}

			event = events.recv(), if sink.is_some() => {
				let Some(event) = event else {
					info!(conn_id = %handle.conn_id, "outbound queue closed (evicted or reaped); closing connection");
					connection.close(quinn::VarInt::from_u32(CLOSE_EVICTED), b"evicted");
					return Ok(());
				};
				let Some(send) = sink.as_mut() else { continue };
				write_event(send, &codec, event, &mut delivered).await?;
			}
		}
	}
}

async fn open_subscription(
	gateway: &Gateway,
	handle: &ConnectionHandle,
	conversation: &ConversationId,
	after_seq: Seq,
) -> Result<(SubscriptionInfo, CatchUpFeed), GatewayError> {
	let info = gateway.subscribe(handle, conversation).await?;
	let feed = gateway.catch_up(handle, conversation, after_seq).await?;
	Ok((info, feed))
}

async fn write_catch_up(
	send: &mut quinn::SendStream,
	codec: &FrameCodec,
	conversation: &ConversationId,
	mut feed: CatchUpFeed,
	delivered: &mut HashMap<ConversationId, Seq>,
) -> anyhow::Result<()> {
	let mut replayed = 0u64;
	while let Some(item) = feed.items.next().await {
		match item.map_err(|e| anyhow!(e).context("catch-up read"))? {
			CatchUpItem::Message(m) => {
				let high = delivered.entry(conversation.clone()).or_insert(0);
				if m.seq <= *high {
					continue;
				}
				*high = m.seq;
				replayed += 1;
				let env = event_envelope(conversation.as_str(), pb::event::Kind::Message((&m).into()));
				write_event_frame(send, codec, env).await?;
			}
			CatchUpItem::CaughtUp { head_seq } => {
				let env = event_envelope(conversation.as_str(), pb::event::Kind::CaughtUp(pb::CaughtUp { head_seq }));
				write_event_frame(send, codec, env).await?;
			}
		}
	}
	metrics::counter!("parley_server_catch_up_messages_total").increment(replayed);
	debug!(conversation_id = %conversation, replayed, "catch-up written");
	Ok(())
}

async fn write_event(
	send: &mut quinn::SendStream,
	codec: &FrameCodec,
	event: FanoutEvent,
	delivered: &mut HashMap<ConversationId, Seq>,
) -> anyhow::Result<()> {
	let env = match event {
		FanoutEvent::Message(m) => {
			let high = delivered.entry(m.conversation_id.clone()).or_insert(0);
			if m.seq <= *high {
				return Ok(());
			}
			*high = m.seq;
			event_envelope(m.conversation_id.as_str(), pb::event::Kind::Message((&*m).into()))
		}
		FanoutEvent::MessageDeleted { conversation_id, seq } => event_envelope(
			conversation_id.as_str(),
			pb::event::Kind::MessageDeleted(pb::MessageDeleted { seq }),
		),
		FanoutEvent::Presence { user_id, snapshot } => {
			event_envelope(String::new(), pb::event::Kind::Presence(presence_state(&user_id, snapshot)))
		}
	};
	write_event_frame(send, codec, env).await
}

async fn write_event_frame(send: &mut quinn::SendStream, codec: &FrameCodec, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = codec.encode(&env).map_err(|e| anyhow!(e))?;
	metrics::counter!("parley_server_events_out_total").increment(1);
	send.write_all(&frame).await.context("events stream write")?;
	Ok(())
}

fn parse_conversation(raw: &str) -> Result<ConversationId, GatewayError> {
	ConversationId::new(raw).map_err(|e| GatewayError::InvalidRequest(format!("conversation_id: {e}")))
}

fn parse_user(raw: &str) -> Result<UserId, GatewayError> {
	UserId::new(raw).map_err(|e| GatewayError::InvalidRequest(format!("user_id: {e}")))
}

async fn handle_request(
	gateway: &Gateway,
	handle: &ConnectionHandle,
	settings: &SessionSettings,
	cmd_tx: &mpsc::UnboundedSender<EventsCommand>,
	kind: pb::request::Kind,
) -> Result<pb::response::Kind, GatewayError> {
	use pb::request::Kind;
	use pb::response::Kind as Reply;

	match kind {
		Kind::Subscribe(sub) => {
			metrics::counter!("parley_server_subscribe_requests_total").increment(1);
			let mut results = Vec::with_capacity(sub.subs.len());
			for s in sub.subs {
				results.push(subscribe_one(cmd_tx, s).await?);
			}
			Ok(Reply::Subscribed(pb::SubscribeResult { results }))
		}

		Kind::Unsubscribe(unsub) => {
			for raw in &unsub.conversation_ids {
				gateway.unsubscribe(handle, &parse_conversation(raw)?);
			}
			Ok(Reply::Ack(pb::Ack {}))
		}

		Kind::SendMessage(m) => {
			let conversation = parse_conversation(&m.conversation_id)?;
			let accepted = gateway
				.send(handle, &conversation, &m.content, IdempotencyToken::new(m.idempotency_token))
				.await?;
			Ok(Reply::Sent(send_result(&accepted)))
		}

		Kind::EditMessage(m) => {
			let conversation = parse_conversation(&m.conversation_id)?;
			let accepted = gateway
				.edit(
					handle,
					&conversation,
					m.target_seq,
					&m.content,
					IdempotencyToken::new(m.idempotency_token),
				)
				.await?;
			Ok(Reply::Sent(send_result(&accepted)))
		}

		Kind::DeleteMessage(m) => {
			let conversation = parse_conversation(&m.conversation_id)?;
			gateway.delete_message(handle, &conversation, m.seq).await?;
			Ok(Reply::Ack(pb::Ack {}))
		}

		Kind::CreateDirect(c) => {
			let conversation = gateway.create_direct(handle, &parse_user(&c.peer_id)?).await?;
			Ok(Reply::Conversation(conversation_info(gateway, &handle.user_id, &conversation)))
		}

		Kind::CreateGroup(c) => {
			let members = c.member_ids.iter().map(|raw| parse_user(raw)).collect::<Result<Vec<_>, _>>()?;
			let conversation = gateway.create_group(handle, members, c.title).await?;
			Ok(Reply::Conversation(conversation_info(gateway, &handle.user_id, &conversation)))
		}

		Kind::UpdateMembers(u) => {
			let conversation = parse_conversation(&u.conversation_id)?;
			let mut latest = None;
			for raw in &u.add {
				latest = Some(gateway.add_member(handle, &conversation, &parse_user(raw)?).await?);
			}
			for raw in &u.remove {
				latest = Some(gateway.remove_member(handle, &conversation, &parse_user(raw)?).await?);
			}
			let latest = latest.ok_or_else(|| GatewayError::InvalidRequest("nothing to add or remove".to_string()))?;
			Ok(Reply::Conversation(conversation_info(gateway, &handle.user_id, &latest)))
		}

		Kind::Archive(a) => {
			let conversation = gateway
				.archive(handle, &parse_conversation(&a.conversation_id)?, a.archived)
				.await?;
			Ok(Reply::Conversation(conversation_info(gateway, &handle.user_id, &conversation)))
		}

		Kind::ListConversations(l) => {
			let limit = if l.limit == 0 {
				settings.default_page_size
			} else {
				l.limit as usize
			};
			let listing = gateway
				.list_conversations(handle, Some(l.cursor.as_str()), limit, Some(l.filter.as_str()))
				.await?;
			Ok(Reply::Conversations(pb::ConversationPage {
				items: listing
					.items
					.iter()
					.map(|view| conversation_summary(&handle.user_id, view))
					.collect(),
				next_cursor: listing.next_cursor.unwrap_or_default(),
			}))
		}

		Kind::Search(s) => {
			let conversation = parse_conversation(&s.conversation_id)?;
			let hits = gateway.search(handle, &conversation, &s.query, s.limit as usize).await?;
			Ok(Reply::SearchResults(pb::SearchResults {
				conversation_id: conversation.to_string(),
				messages: hits.iter().map(pb::MessageRecord::from).collect(),
			}))
		}

		Kind::MarkRead(m) => {
			gateway
				.mark_read(handle, &parse_conversation(&m.conversation_id)?, m.seq)
				.await?;
			Ok(Reply::Ack(pb::Ack {}))
		}

		Kind::WatchPresence(w) => {
			let target = parse_user(&w.user_id)?;
			let snapshot = gateway.watch_presence(handle, &target)?;
			Ok(Reply::Presence(presence_state(&target, snapshot)))
		}
	}
}

async fn subscribe_one(
	cmd_tx: &mpsc::UnboundedSender<EventsCommand>,
	sub: pb::Subscription,
) -> Result<pb::SubscriptionResult, GatewayError> {
	let status_only = |status: pb::SubscriptionStatus| pb::SubscriptionResult {
		conversation_id: sub.conversation_id.clone(),
		status: status as i32,
		head_seq: 0,
		oldest_available_seq: 0,
	};

	let Ok(conversation) = ConversationId::new(sub.conversation_id.as_str()) else {
		return Ok(status_only(pb::SubscriptionStatus::UnknownConversation));
	};

	let (reply_tx, reply_rx) = oneshot::channel();
	cmd_tx
		.send(EventsCommand::Subscribe {
			conversation,
			after_seq: sub.after_seq,
			reply: reply_tx,
		})
		.map_err(|_| GatewayError::from(SendRejection::UnknownConnection))?;
	let outcome = reply_rx
		.await
		.map_err(|_| GatewayError::from(SendRejection::UnknownConnection))?;

	match outcome {
		Ok(info) => Ok(pb::SubscriptionResult {
			conversation_id: sub.conversation_id.clone(),
			status: pb::SubscriptionStatus::Ok as i32,
			head_seq: info.head_seq,
			oldest_available_seq: info.oldest_available,
		}),
		Err(GatewayError::Rejected(SendRejection::NotAMember)) => Ok(status_only(pb::SubscriptionStatus::NotAMember)),
		Err(GatewayError::Rejected(SendRejection::UnknownConversation)) => {
			Ok(status_only(pb::SubscriptionStatus::UnknownConversation))
		}
		Err(other) => Err(other),
	}
}

fn send_result(accepted: &SendAccepted) -> pb::SendResult {
	let status = if accepted.duplicate {
		pb::SendStatus::Duplicate
	} else {
		pb::SendStatus::Accepted
	};
	pb::SendResult {
		conversation_id: accepted.message.conversation_id.to_string(),
		seq: accepted.message.seq,
		status: status as i32,
		created_at_unix_ms: accepted.message.created_at_unix_ms,
	}
}

fn member_info(profile: UserProfile, presence: PresenceSnapshot) -> pb::MemberInfo {
	pb::MemberInfo {
		user_id: profile.id.to_string(),
		display_name: profile.display_name,
		avatar_ref: profile.avatar_ref,
		online: presence.is_online(),
		last_seen_unix_ms: presence.last_seen_unix_ms,
	}
}

fn conversation_info(gateway: &Gateway, viewer: &UserId, conversation: &Conversation) -> pb::ConversationInfo {
	let members = conversation
		.member_ids()
		.map(|id| member_info(gateway.profiles().get(id), gateway.presence().status(id)))
		.collect();
	info_with_members(conversation, viewer, members)
}

fn info_with_members(conversation: &Conversation, viewer: &UserId, members: Vec<pb::MemberInfo>) -> pb::ConversationInfo {
	pb::ConversationInfo {
		id: conversation.id.to_string(),
		kind: conversation.kind.as_str().to_string(),
		title: conversation.title.clone(),
		members,
		archived: conversation.is_archived_for(viewer),
		created_at_unix_ms: conversation.created_at_unix_ms,
		last_activity_unix_ms: conversation.last_activity_unix_ms,
	}
}

fn conversation_summary(viewer: &UserId, view: &ConversationView) -> pb::ConversationSummary {
	let members = view
		.members
		.iter()
		.map(|m| member_info(m.profile.clone(), m.presence))
		.collect();
	pb::ConversationSummary {
		info: Some(info_with_members(&view.conversation, viewer, members)),
		last_message: view.last_message.as_ref().map(|m| pb::LastMessage {
			content: m.content.clone(),
			created_at_unix_ms: m.created_at_unix_ms,
		}),
		unread_count: view.unread_count,
		head_seq: view.head_seq,
	}
}

/// Map a gateway failure to its wire code and detail.
pub fn error_code(err: &GatewayError) -> (pb::ErrorCode, u64) {
	match err {
		GatewayError::Rejected(rejection) => match rejection {
			SendRejection::NotAMember => (pb::ErrorCode::NotAMember, 0),
			SendRejection::PayloadTooLarge { max, .. } => (pb::ErrorCode::PayloadTooLarge, *max as u64),
			SendRejection::EmptyContent => (pb::ErrorCode::EmptyContent, 0),
			SendRejection::UnknownConversation => (pb::ErrorCode::UnknownConversation, 0),
			SendRejection::Conflict { seq } => (pb::ErrorCode::Conflict, *seq),
			SendRejection::StorageUnavailable(_) => (pb::ErrorCode::StorageUnavailable, 0),
			SendRejection::UnknownConnection => (pb::ErrorCode::Unauthorized, 0),
		},
		GatewayError::Forbidden(_) => (pb::ErrorCode::Forbidden, 0),
		GatewayError::UnknownMessage { seq } => (pb::ErrorCode::InvalidRequest, *seq),
		GatewayError::InvalidRequest(_) => (pb::ErrorCode::InvalidRequest, 0),
	}
}

fn request_error(request_id: String, handle: &ConnectionHandle, err: &GatewayError) -> pb::Envelope {
	let (code, detail) = error_code(err);
	metrics::counter!("parley_server_request_errors_total", "code" => code.as_str_name()).increment(1);
	debug!(conn_id = %handle.conn_id, request_id = %request_id, code = code.as_str_name(), error = %err, "request failed");
	error_envelope_with_detail(request_id, code, err.to_string(), detail)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conflict_carries_existing_seq() {
		let err = GatewayError::from(SendRejection::Conflict { seq: 7 });
		assert_eq!(error_code(&err), (pb::ErrorCode::Conflict, 7));
	}

	#[test]
	fn payload_too_large_carries_limit() {
		let err = GatewayError::from(SendRejection::PayloadTooLarge { len: 9, max: 8 });
		assert_eq!(error_code(&err), (pb::ErrorCode::PayloadTooLarge, 8));
	}

	#[test]
	fn ownership_and_lookup_failures() {
		assert_eq!(
			error_code(&GatewayError::Forbidden("x".into())).0,
			pb::ErrorCode::Forbidden
		);
		assert_eq!(
			error_code(&GatewayError::UnknownMessage { seq: 3 }),
			(pb::ErrorCode::InvalidRequest, 3)
		);
		assert_eq!(
			error_code(&GatewayError::from(SendRejection::UnknownConnection)).0,
			pb::ErrorCode::Unauthorized
		);
	}

	#[test]
	fn bad_ids_are_invalid_requests() {
		assert!(matches!(parse_conversation(""), Err(GatewayError::InvalidRequest(_))));
		assert!(matches!(parse_user("  "), Err(GatewayError::InvalidRequest(_))));
	}
}
