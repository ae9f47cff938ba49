#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use futures::Stream;
use parley_protocol::convert::{envelope, request_envelope};
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameCodec, FramingError, QuicEndpoint, pb};
use quinn::{Endpoint, TransportConfig, VarInt};
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tracing::{debug, info, warn};

mod navigator;
mod tracker;

pub use navigator::SearchNavigator;
pub use tracker::{CatchUpTracker, EventDisposition};

/// Local dev server endpoint.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18300";

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// TLS server name; also resolved via DNS when `server_addr` is unset.
	pub server_host: String,
	pub server_port: u16,
	/// Resolved address override.
	pub server_addr: Option<SocketAddr>,

	pub client_name: String,
	pub client_instance_id: String,

	/// Signed credential presented in `Hello`.
	pub credential: String,

	/// DER certificate to trust. `None` skips verification (dev only).
	pub server_cert_der: Option<Vec<u8>>,

	pub max_frame_bytes: usize,
	pub connect_timeout: Duration,
}

impl ClientConfig {
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint).map_err(|e| ClientCoreError::Protocol(e.to_string()))?;
		Ok(Self {
			server_addr: e.socket_addr().ok(),
			server_host: e.server_name().to_string(),
			server_port: e.port,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18300,
			server_addr: Some(SocketAddr::from(([127, 0, 0, 1], 18300))),
			client_name: format!("parley-client-core/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: "dev-instance".to_string(),
			credential: String::new(),
			server_cert_der: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering or types.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered with an `Error` envelope.
	#[error("server error {}: {message}", .code.as_str_name())]
	Server {
		code: pb::ErrorCode,
		message: String,
		detail: u64,
	},

	#[error("io error: {0}")]
	Io(String),

	#[error("error: {0}")]
	Other(String),
}

impl ClientCoreError {
	fn from_server(err: pb::Error) -> Self {
		ClientCoreError::Server {
			code: pb::ErrorCode::try_from(err.code).unwrap_or(pb::ErrorCode::Unspecified),
			message: err.message,
			detail: err.detail,
		}
	}

	/// Wire error code, when the server rejected the request.
	pub fn code(&self) -> Option<pb::ErrorCode> {
		match self {
			ClientCoreError::Server { code, .. } => Some(*code),
			_ => None,
		}
	}
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Fresh idempotency token for a send.
pub fn new_idempotency_token() -> String {
	uuid::Uuid::new_v4().to_string()
}

/// Control half of a session: requests, pings, close.
pub struct SessionControl {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	reader: FrameReader,
	codec: FrameCodec,
	next_request_id: u64,
	events_opened: bool,
}

/// Events half of a session. The server only writes on this stream.
pub struct SessionEvents {
	reader: FrameReader,
	// Dropping the send half would finish the stream from our side.
	_events_send_keepalive: quinn::SendStream,
}

struct FrameReader {
	recv: quinn::RecvStream,
	buf: BytesMut,
	codec: FrameCodec,
}

impl FrameReader {
	fn new(recv: quinn::RecvStream, max_frame_bytes: usize) -> Self {
		Self {
			recv,
			buf: BytesMut::with_capacity(16 * 1024),
			codec: FrameCodec::new(max_frame_bytes),
		}
	}

	/// Next envelope, or `None` on a clean end of stream.
	async fn next(&mut self) -> Result<Option<pb::Envelope>, ClientCoreError> {
		let mut tmp = [0u8; 8192];
		loop {
			if let Some(env) = self.codec.try_decode::<pb::Envelope>(&mut self.buf)? {
				return Ok(Some(env));
			}
			match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => self.buf.extend_from_slice(&tmp[..n]),
				Ok(None) if self.buf.is_empty() => return Ok(None),
				Ok(None) => {
					return Err(ClientCoreError::Protocol(
						"stream closed before receiving full message".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			}
		}
	}

	async fn expect(&mut self) -> Result<pb::Envelope, ClientCoreError> {
		self.next()
			.await?
			.ok_or_else(|| ClientCoreError::Protocol("stream closed while awaiting a reply".to_string()))
	}
}

macro_rules! expect_response {
	($resp:expr, $variant:ident) => {
		match $resp {
			pb::response::Kind::$variant(v) => Ok(v),
			other => Err(ClientCoreError::Protocol(format!(
				concat!("expected ", stringify!($variant), ", got {:?}"),
				other
			))),
		}
	};
}

impl SessionControl {
	/// Connect, send `Hello`, and wait for `Welcome`.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, pb::Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg =
			make_client_config(cfg.server_cert_der.as_deref()).map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}")),
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					))
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(last_err.unwrap_or_else(|| format!("no addresses attempted (sni={server_name})")))
		})?;
		info!(remote = %conn.remote_address(), "connected");

		let (mut control_send, control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let codec = FrameCodec::new(cfg.max_frame_bytes);
		let hello = envelope(
			String::new(),
			pb::envelope::Msg::Hello(pb::Hello {
				credential: cfg.credential,
				client_name: cfg.client_name,
				client_instance_id: cfg.client_instance_id,
			}),
		);
		write_envelope(&mut control_send, &codec, &hello).await?;

		let mut reader = FrameReader::new(control_recv, cfg.max_frame_bytes);
		let reply = tokio::time::timeout(connect_timeout, reader.expect())
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for Welcome after {connect_timeout:?}")))??;

		let welcome = match reply.msg {
			Some(pb::envelope::Msg::Welcome(w)) => w,
			Some(pb::envelope::Msg::Error(e)) => return Err(ClientCoreError::from_server(e)),
			other => return Err(ClientCoreError::Protocol(format!("expected Welcome, got {other:?}"))),
		};

		debug!(
			server_name = %welcome.server_name,
			user_id = %welcome.user_id,
			connection_id = welcome.connection_id,
			"received Welcome"
		);

		let max_frame_bytes = match welcome.max_frame_size as usize {
			0 => cfg.max_frame_bytes,
			n => n.min(cfg.max_frame_bytes),
		};
		reader.codec = FrameCodec::new(max_frame_bytes);

		let control = Self {
			conn,
			control_send,
			reader,
			codec: FrameCodec::new(max_frame_bytes),
			next_request_id: 1,
			events_opened: false,
		};
		Ok((control, welcome))
	}

	/// Send one request and wait for its response.
	pub async fn request(&mut self, kind: pb::request::Kind) -> Result<pb::response::Kind, ClientCoreError> {
		let request_id = self.next_request_id.to_string();
		self.next_request_id += 1;

		let env = request_envelope(request_id.clone(), kind);
		write_envelope(&mut self.control_send, &self.codec, &env).await?;

		let reply = self.reader.expect().await?;
		if reply.request_id != request_id {
			return Err(ClientCoreError::Protocol(format!(
				"response for request {} while awaiting {request_id}",
				reply.request_id
			)));
		}
		match reply.msg {
			Some(pb::envelope::Msg::Response(pb::Response { kind: Some(kind) })) => Ok(kind),
			Some(pb::envelope::Msg::Error(e)) => Err(ClientCoreError::from_server(e)),
			other => Err(ClientCoreError::Protocol(format!("expected Response, got {other:?}"))),
		}
	}

	/// Subscribe with resume points `(conversation_id, after_seq)`.
	///
	/// After the first subscribe the server waits for [`Self::open_events_stream`].
	pub async fn subscribe(
		&mut self,
		subs: impl IntoIterator<Item = (String, u64)>,
	) -> Result<pb::SubscribeResult, ClientCoreError> {
		let subs: Vec<pb::Subscription> = subs
			.into_iter()
			.map(|(conversation_id, after_seq)| pb::Subscription {
				conversation_id,
				after_seq,
			})
			.collect();
		debug!(subs = subs.len(), "sending subscribe");
		let resp = self.request(pb::request::Kind::Subscribe(pb::Subscribe { subs })).await?;
		expect_response!(resp, Subscribed)
	}

	pub async fn unsubscribe(&mut self, conversation_ids: impl IntoIterator<Item = String>) -> Result<(), ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::Unsubscribe(pb::Unsubscribe {
				conversation_ids: conversation_ids.into_iter().collect(),
			}))
			.await?;
		expect_response!(resp, Ack).map(|_| ())
	}

	pub async fn send_message(
		&mut self,
		conversation_id: &str,
		content: &str,
		idempotency_token: &str,
	) -> Result<pb::SendResult, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::SendMessage(pb::SendMessage {
				conversation_id: conversation_id.to_string(),
				content: content.to_string(),
				idempotency_token: idempotency_token.to_string(),
			}))
			.await?;
		expect_response!(resp, Sent)
	}

	pub async fn edit_message(
		&mut self,
		conversation_id: &str,
		target_seq: u64,
		content: &str,
		idempotency_token: &str,
	) -> Result<pb::SendResult, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::EditMessage(pb::EditMessage {
				conversation_id: conversation_id.to_string(),
				target_seq,
				content: content.to_string(),
				idempotency_token: idempotency_token.to_string(),
			}))
			.await?;
		expect_response!(resp, Sent)
	}

	pub async fn delete_message(&mut self, conversation_id: &str, seq: u64) -> Result<(), ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::DeleteMessage(pb::DeleteMessage {
				conversation_id: conversation_id.to_string(),
				seq,
			}))
			.await?;
		expect_response!(resp, Ack).map(|_| ())
	}

	pub async fn create_direct(&mut self, peer_id: &str) -> Result<pb::ConversationInfo, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::CreateDirect(pb::CreateDirect {
				peer_id: peer_id.to_string(),
			}))
			.await?;
		expect_response!(resp, Conversation)
	}

	pub async fn create_group(
		&mut self,
		member_ids: impl IntoIterator<Item = String>,
		title: Option<String>,
	) -> Result<pb::ConversationInfo, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::CreateGroup(pb::CreateGroup {
				member_ids: member_ids.into_iter().collect(),
				title,
			}))
			.await?;
		expect_response!(resp, Conversation)
	}

	pub async fn update_members(
		&mut self,
		conversation_id: &str,
		add: Vec<String>,
		remove: Vec<String>,
	) -> Result<pb::ConversationInfo, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::UpdateMembers(pb::UpdateMembers {
				conversation_id: conversation_id.to_string(),
				add,
				remove,
			}))
			.await?;
		expect_response!(resp, Conversation)
	}

	pub async fn archive(&mut self, conversation_id: &str, archived: bool) -> Result<pb::ConversationInfo, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::Archive(pb::Archive {
				conversation_id: conversation_id.to_string(),
				archived,
			}))
			.await?;
		expect_response!(resp, Conversation)
	}

	/// One page of conversation summaries. An empty `cursor` starts from the top.
	pub async fn list_conversations(
		&mut self,
		cursor: &str,
		limit: u32,
		filter: &str,
	) -> Result<pb::ConversationPage, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::ListConversations(pb::ListConversations {
				cursor: cursor.to_string(),
				limit,
				filter: filter.to_string(),
			}))
			.await?;
		expect_response!(resp, Conversations)
	}

	/// Walk every page of the listing.
	pub async fn list_all_conversations(
		&mut self,
		page_size: u32,
		filter: &str,
	) -> Result<Vec<pb::ConversationSummary>, ClientCoreError> {
		let mut items = Vec::new();
		let mut cursor = String::new();
		loop {
			let page = self.list_conversations(&cursor, page_size, filter).await?;
			items.extend(page.items);
			if page.next_cursor.is_empty() {
				return Ok(items);
			}
			cursor = page.next_cursor;
		}
	}

	pub async fn search(
		&mut self,
		conversation_id: &str,
		query: &str,
		limit: u32,
	) -> Result<pb::SearchResults, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::Search(pb::Search {
				conversation_id: conversation_id.to_string(),
				query: query.to_string(),
				limit,
			}))
			.await?;
		expect_response!(resp, SearchResults)
	}

	pub async fn mark_read(&mut self, conversation_id: &str, seq: u64) -> Result<(), ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::MarkRead(pb::MarkRead {
				conversation_id: conversation_id.to_string(),
				seq,
			}))
			.await?;
		expect_response!(resp, Ack).map(|_| ())
	}

	/// Current presence of `user_id`; later changes arrive on the events stream.
	pub async fn watch_presence(&mut self, user_id: &str) -> Result<pb::PresenceState, ClientCoreError> {
		let resp = self
			.request(pb::request::Kind::WatchPresence(pb::WatchPresence {
				user_id: user_id.to_string(),
			}))
			.await?;
		expect_response!(resp, Presence)
	}

	/// Keepalive ping; also refreshes the server's idle timer.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientCoreError> {
		let env = envelope(String::new(), pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms }));
		write_envelope(&mut self.control_send, &self.codec, &env).await?;

		match self.reader.expect().await?.msg {
			Some(pb::envelope::Msg::Pong(p)) => Ok(p),
			other => Err(ClientCoreError::Protocol(format!("expected Pong, got {other:?}"))),
		}
	}

	/// Open the events stream. Call once, right after the first subscribe.
	pub async fn open_events_stream(&mut self) -> Result<SessionEvents, ClientCoreError> {
		if self.events_opened {
			return Err(ClientCoreError::Protocol(
				"events stream already opened; reuse the existing SessionEvents".to_string(),
			));
		}

		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientCoreError::Io(format!("open_bi(events) failed: {e}")))?;

		// The peer only sees a stream once it carries data.
		send.write_all(&[0u8])
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to write events stream activation byte: {e}")))?;
		send.flush()
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to flush events stream activation byte: {e}")))?;
		debug!("opened events stream");

		self.events_opened = true;
		Ok(SessionEvents {
			reader: FrameReader::new(recv, self.codec.max_frame_size()),
			_events_send_keepalive: send,
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	/// Resolves when the connection closes, with the reason.
	pub async fn closed(&self) -> quinn::ConnectionError {
		self.conn.closed().await
	}
}

impl SessionEvents {
	/// Next event, or `None` once the server closes the stream.
	pub async fn next_event(&mut self) -> Result<Option<pb::Event>, ClientCoreError> {
		loop {
			let Some(env) = self.reader.next().await? else {
				info!("events stream closed");
				return Ok(None);
			};
			match env.msg {
				Some(pb::envelope::Msg::Event(ev)) => {
					debug!(conversation_id = %ev.conversation_id, event_kind = event_kind(&ev), "events stream decoded");
					return Ok(Some(ev));
				}
				other => warn!("unexpected message on events stream: {:?}", other),
			}
		}
	}

	/// Run until EOF or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(pb::Event),
	{
		while let Some(ev) = self.next_event().await? {
			on_event(ev);
		}
		Ok(())
	}

	pub fn into_stream(self) -> impl Stream<Item = Result<pb::Event, ClientCoreError>> {
		futures::stream::try_unfold(self, |mut events| async move {
			Ok(events.next_event().await?.map(|ev| (ev, events)))
		})
	}
}

pub fn event_kind(ev: &pb::Event) -> &'static str {
	match ev.kind.as_ref() {
		Some(pb::event::Kind::Message(_)) => "message",
		Some(pb::event::Kind::CaughtUp(_)) => "caught_up",
		Some(pb::event::Kind::Presence(_)) => "presence",
		Some(pb::event::Kind::MessageDeleted(_)) => "message_deleted",
		None => "empty",
	}
}

async fn write_envelope<W: AsyncWrite + Unpin>(
	send: &mut W,
	codec: &FrameCodec,
	env: &pb::Envelope,
) -> Result<(), ClientCoreError> {
	let frame = codec.encode(env)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	send.flush().await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0))).context("create client endpoint")
}

fn make_client_config(trusted_cert_der: Option<&[u8]>) -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let mut tls = match trusted_cert_der {
		Some(der) => {
			let mut roots = rustls::RootCertStore::empty();
			roots
				.add(rustls::pki_types::CertificateDer::from(der.to_vec()))
				.context("add trusted server cert")?;
			rustls::ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		}
		None => {
			let mut tls = rustls::ClientConfig::builder()
				.with_root_certificates(rustls::RootCertStore::empty())
				.with_no_client_auth();
			tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
			tls
		}
	};
	tls.alpn_protocols = vec![parley_protocol::version::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(8));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(Duration::from_secs(15)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

/// Dev-only verifier that accepts any server certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::pki_types::CertificateDer<'_>,
		_intermediates: &[rustls::pki_types::CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls::pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_targets_local_dev_server() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_port, 18300);
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn endpoint_config_resolves_ip_literals_only() {
		let ip = ClientConfig::from_quic_endpoint("quic://[::1]:4433").unwrap();
		assert_eq!(ip.server_host, "::1");
		assert_eq!(ip.server_addr.map(|a| a.port()), Some(4433));

		let dns = ClientConfig::from_quic_endpoint("quic://chat.example.org:443").unwrap();
		assert_eq!(dns.server_host, "chat.example.org");
		assert!(dns.server_addr.is_none());

		assert!(ClientConfig::from_quic_endpoint("chat.example.org:443").is_err());
	}

	#[tokio::test]
	async fn envelopes_are_written_as_whole_frames() {
		let codec = FrameCodec::new(1024);
		let env = pb::Envelope {
			version: 1,
			request_id: "r7".into(),
			..Default::default()
		};
		let mut out: Vec<u8> = Vec::new();
		write_envelope(&mut out, &codec, &env).await.unwrap();

		let (decoded, used) = codec.decode::<pb::Envelope>(&out).unwrap();
		assert_eq!(decoded, env);
		assert_eq!(used, out.len());
	}

	#[test]
	fn server_errors_keep_their_code() {
		let err = ClientCoreError::from_server(pb::Error {
			code: pb::ErrorCode::Conflict as i32,
			message: "token reused".into(),
			detail: 4,
		});
		assert_eq!(err.code(), Some(pb::ErrorCode::Conflict));
		assert!(err.to_string().contains("CONFLICT"));

		let unknown = ClientCoreError::from_server(pb::Error {
			code: 999,
			message: String::new(),
			detail: 0,
		});
		assert_eq!(unknown.code(), Some(pb::ErrorCode::Unspecified));
	}
}
