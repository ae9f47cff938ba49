#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parley_domain::{
	ConnectionId, ContentError, Conversation, ConversationId, ConversationSummary, IdempotencyToken, LastMessage,
	MemberSummary, Message, PresenceSnapshot, Seq, UserId, UserProfile, format_unix_ms_rfc3339, validate_content,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::auth::{AuthError, Identity, IdentityProvider};
use crate::server::fanout::{FanoutConfig, FanoutEvent, FanoutRouter};
use crate::server::log::{AppendRequest, DeliveryLog, LogError};
use crate::server::presence::{PresenceTracker, PresenceTransition};
use crate::server::profiles::ProfileDirectory;
use crate::server::registry::{ConversationRegistry, PageCursor, RegistryError};
use crate::server::search::SearchIndex;
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub max_content_code_points: usize,
	/// Upper bound on a credential check; expiry fails the connect.
	pub auth_timeout: Duration,
	pub idle_timeout: Duration,
	pub reaper_interval: Duration,
	pub outbound_queue_capacity: usize,
	pub debug_logs: bool,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			max_content_code_points: parley_domain::DEFAULT_MAX_CONTENT_CODE_POINTS,
			auth_timeout: Duration::from_secs(5),
			idle_timeout: Duration::from_secs(60),
			reaper_interval: Duration::from_secs(5),
			outbound_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// An authenticated connection as known to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
	pub conn_id: ConnectionId,
	pub user_id: UserId,
}

pub struct Connected {
	pub handle: ConnectionHandle,
	pub identity: Identity,
	pub events: mpsc::Receiver<FanoutEvent>,
	/// Resolves once the gateway drops this connection (eviction, idle reaping
	/// or disconnect).
	pub closed: oneshot::Receiver<()>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendRejection {
	#[error("not a member of this conversation")]
	NotAMember,

	#[error("content is {len} code points; the limit is {max}")]
	PayloadTooLarge { len: usize, max: usize },

	#[error("content is empty")]
	EmptyContent,

	#[error("unknown conversation")]
	UnknownConversation,

	#[error("idempotency token already used by seq {seq} with different content")]
	Conflict { seq: Seq },

	#[error("storage unavailable: {0}")]
	StorageUnavailable(String),

	#[error("connection is not registered")]
	UnknownConnection,
}

impl SendRejection {
	/// Metric label.
	pub fn reason(&self) -> &'static str {
		match self {
			SendRejection::NotAMember => "not_a_member",
			SendRejection::PayloadTooLarge { .. } => "payload_too_large",
			SendRejection::EmptyContent => "empty_content",
			SendRejection::UnknownConversation => "unknown_conversation",
			SendRejection::Conflict { .. } => "conflict",
			SendRejection::StorageUnavailable(_) => "storage_unavailable",
			SendRejection::UnknownConnection => "unknown_connection",
		}
	}
}

impl From<ContentError> for SendRejection {
	fn from(err: ContentError) -> Self {
		match err {
			ContentError::Empty => SendRejection::EmptyContent,
			ContentError::TooLarge { len, max } => SendRejection::PayloadTooLarge { len, max },
		}
	}
}

impl From<LogError> for SendRejection {
	fn from(err: LogError) -> Self {
		match err {
			LogError::Conflict { seq } => SendRejection::Conflict { seq },
			LogError::NotFound { seq } => SendRejection::StorageUnavailable(format!("message {seq} vanished")),
			LogError::Unavailable(msg) => SendRejection::StorageUnavailable(msg),
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
	#[error(transparent)]
	Rejected(#[from] SendRejection),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("message {seq} not found")]
	UnknownMessage { seq: Seq },

	#[error("invalid request: {0}")]
	InvalidRequest(String),
}

impl From<RegistryError> for GatewayError {
	fn from(err: RegistryError) -> Self {
		match err {
			RegistryError::UnknownConversation(_) => SendRejection::UnknownConversation.into(),
			RegistryError::NotAMember { .. } => SendRejection::NotAMember.into(),
			RegistryError::Storage(msg) => SendRejection::StorageUnavailable(msg).into(),
			other @ (RegistryError::InvalidMembers(_) | RegistryError::NotAGroup | RegistryError::InvalidCursor) => {
				GatewayError::InvalidRequest(other.to_string())
			}
		}
	}
}

impl From<LogError> for GatewayError {
	fn from(err: LogError) -> Self {
		match err {
			LogError::NotFound { seq } => GatewayError::UnknownMessage { seq },
			other => GatewayError::Rejected(other.into()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAccepted {
	pub message: Message,
	/// Same token and content as an earlier send; nothing new was stored.
	pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionInfo {
	pub head_seq: Seq,
	pub oldest_available: Seq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpItem {
	Message(Message),
	/// Everything up to `head_seq` has been yielded; live delivery follows.
	CaughtUp { head_seq: Seq },
}

pub struct CatchUpFeed {
	pub head_seq: Seq,
	pub oldest_available: Seq,
	pub items: BoxStream<'static, Result<CatchUpItem, GatewayError>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
	pub profile: UserProfile,
	pub presence: PresenceSnapshot,
}

/// A conversation as shown in a member's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
	pub conversation: Conversation,
	pub members: Vec<MemberView>,
	pub last_message: Option<Message>,
	pub unread_count: u64,
	pub head_seq: Seq,
}

impl ConversationView {
	fn matches(&self, filter: &str) -> bool {
		let filter = filter.to_lowercase();
		let title = self.conversation.title.as_deref().unwrap_or_default();
		title.to_lowercase().contains(&filter)
			|| self
				.last_message
				.as_ref()
				.is_some_and(|m| m.content.to_lowercase().contains(&filter))
			|| self
				.members
				.iter()
				.any(|m| m.profile.display_name.to_lowercase().contains(&filter))
	}

	pub fn to_summary(&self) -> ConversationSummary {
		ConversationSummary {
			id: self.conversation.id.to_string(),
			kind: self.conversation.kind,
			title: self.conversation.title.clone(),
			members: self
				.members
				.iter()
				.map(|m| MemberSummary {
					id: m.profile.id.to_string(),
					display_name: m.profile.display_name.clone(),
					avatar_ref: m.profile.avatar_ref.clone(),
					online: m.presence.is_online(),
					last_seen: m.presence.last_seen_unix_ms.map(format_unix_ms_rfc3339),
				})
				.collect(),
			last_message: self.last_message.as_ref().map(|m| LastMessage {
				content: m.content.clone(),
				created_at: format_unix_ms_rfc3339(m.created_at_unix_ms),
			}),
			unread_count: self.unread_count,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ConversationListing {
	pub items: Vec<ConversationView>,
	/// Opaque cursor for the next page, if any.
	pub next_cursor: Option<String>,
}

struct Inner {
	cfg: GatewayConfig,
	identity: Arc<dyn IdentityProvider>,
	profiles: ProfileDirectory,
	presence: PresenceTracker,
	registry: ConversationRegistry,
	log: DeliveryLog,
	router: FanoutRouter,
	search: SearchIndex,
	next_conn_id: AtomicU64,
}

/// Entry point for every client operation.
#[derive(Clone)]
pub struct Gateway {
	inner: Arc<Inner>,
}

impl Gateway {
	pub fn new(
		cfg: GatewayConfig,
		identity: Arc<dyn IdentityProvider>,
		registry: ConversationRegistry,
		log: DeliveryLog,
	) -> Self {
		let router = FanoutRouter::new(FanoutConfig {
			outbound_queue_capacity: cfg.outbound_queue_capacity,
			debug_logs: cfg.debug_logs,
		});
		Self {
			inner: Arc::new(Inner {
				cfg,
				identity,
				profiles: ProfileDirectory::new(),
				presence: PresenceTracker::new(),
				registry,
				log,
				router,
				search: SearchIndex::new(),
				next_conn_id: AtomicU64::new(0),
			}),
		}
	}

	pub fn config(&self) -> &GatewayConfig {
		&self.inner.cfg
	}

	pub fn presence(&self) -> &PresenceTracker {
		&self.inner.presence
	}

	pub fn registry(&self) -> &ConversationRegistry {
		&self.inner.registry
	}

	pub fn log(&self) -> &DeliveryLog {
		&self.inner.log
	}

	pub fn router(&self) -> &FanoutRouter {
		&self.inner.router
	}

	pub fn profiles(&self) -> &ProfileDirectory {
		&self.inner.profiles
	}

	/// Authenticate and register a new connection.
	pub async fn connect(&self, credential: &str) -> Result<Connected, AuthError> {
		let identity = tokio::time::timeout(self.inner.cfg.auth_timeout, self.inner.identity.verify(credential))
			.await
			.map_err(|_| AuthError::Timeout)??;

		self.inner.profiles.remember(&identity);

		let conn_id = ConnectionId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1);
		let user_id = identity.user_id.clone();
		let (events, closed) = self.inner.router.register_session(&user_id, conn_id);

		if self.inner.presence.mark_online(&user_id, conn_id, Instant::now()) == PresenceTransition::WentOnline {
			let evicted = self.notify_presence(&user_id);
			self.drop_evicted(evicted);
		}
		info!(%conn_id, user_id = %user_id, "gateway: connected");

		Ok(Connected {
			handle: ConnectionHandle { conn_id, user_id },
			identity,
			events,
			closed,
		})
	}

	/// Tear down a connection. Safe to call more than once.
	pub fn disconnect(&self, handle: &ConnectionHandle) {
		let mut pending = vec![handle.clone()];
		// Offline pushes can evict further slow watchers.
		while let Some(handle) = pending.pop() {
			self.inner.router.unregister(handle.conn_id);

			match self
				.inner
				.presence
				.mark_offline(&handle.user_id, handle.conn_id, unix_ms_now())
			{
				Ok(PresenceTransition::WentOffline { .. }) => {
					self.inner.presence.forget_viewer(&handle.user_id);
					pending.extend(
						self.notify_presence(&handle.user_id)
							.into_iter()
							.map(|(conn_id, user_id)| ConnectionHandle { conn_id, user_id }),
					);
				}
				Ok(_) => {}
				Err(err) => {
					debug!(conn_id = %handle.conn_id, error = %err, "gateway: disconnect of unknown connection");
					continue;
				}
			}
			info!(conn_id = %handle.conn_id, user_id = %handle.user_id, "gateway: disconnected");
		}
	}

	/// Finish evictions done by the router: presence and watchers follow.
	fn drop_evicted(&self, evicted: Vec<(ConnectionId, UserId)>) {
		for (conn_id, user_id) in evicted {
			info!(%conn_id, user_id = %user_id, "gateway: dropping evicted connection");
			self.disconnect(&ConnectionHandle { conn_id, user_id });
		}
	}

	/// Refresh the idle timer. Returns `false` once the connection is gone.
	pub fn heartbeat(&self, handle: &ConnectionHandle) -> bool {
		self.inner.presence.touch(handle.conn_id, Instant::now())
	}

	/// Push `subject`'s current presence to watchers that share a conversation with them.
	///
	/// Returns connections evicted along the way; the caller drops them.
	#[must_use]
	fn notify_presence(&self, subject: &UserId) -> Vec<(ConnectionId, UserId)> {
		let snapshot = self.inner.presence.status(subject);
		let mut evicted = Vec::new();
		for viewer in self.inner.presence.viewers_of(subject) {
			if !self.inner.registry.shares_conversation(&viewer, subject) {
				continue;
			}
			let report = self.inner.router.deliver_to_user(
				&viewer,
				FanoutEvent::Presence {
					user_id: subject.clone(),
					snapshot,
				},
			);
			if !report.evicted.is_empty() {
				warn!(viewer = %viewer, subject = %subject, evicted = report.evicted.len(), "gateway: presence push evicted connections");
			}
			evicted.extend(report.evicted);
		}
		evicted
	}

	fn member_of(&self, handle: &ConnectionHandle, conversation: &ConversationId) -> Result<Conversation, GatewayError> {
		if !self.inner.router.is_registered(handle.conn_id) {
			return Err(SendRejection::UnknownConnection.into());
		}
		Ok(self.inner.registry.require_member(conversation, &handle.user_id)?)
	}

	pub async fn send(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		content: &str,
		token: IdempotencyToken,
	) -> Result<SendAccepted, SendRejection> {
		let result = self.append_message(handle, conversation, content, token, None).await;
		if let Err(rejection) = &result {
			metrics::counter!("parley_server_send_rejected_total", "reason" => rejection.reason()).increment(1);
			debug!(conn_id = %handle.conn_id, conversation_id = %conversation, reason = rejection.reason(), "gateway: send rejected");
		}
		result
	}

	async fn append_message(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		content: &str,
		token: IdempotencyToken,
		revises: Option<Seq>,
	) -> Result<SendAccepted, SendRejection> {
		self.member_of(handle, conversation).map_err(|err| match err {
			GatewayError::Rejected(rejection) => rejection,
			other => SendRejection::StorageUnavailable(other.to_string()),
		})?;
		validate_content(content, self.inner.cfg.max_content_code_points)?;

		let request = AppendRequest {
			conversation_id: conversation.clone(),
			sender_id: handle.user_id.clone(),
			content: content.to_string(),
			idempotency_token: token,
			revises,
			created_at_unix_ms: unix_ms_now(),
		};

		let router = &self.inner.router;
		let (appended, report) = self
			.inner
			.log
			.append_and_then(request, |message| {
				router.publish(conversation, FanoutEvent::Message(Arc::new(message.clone())))
			})
			.await?;

		if let Some(report) = report {
			if !report.evicted.is_empty() {
				warn!(conversation_id = %conversation, evicted = report.evicted.len(), "gateway: slow subscribers evicted");
			}
			self.drop_evicted(report.evicted);

			let message = &appended.message;
			self.inner.search.index(message);
			if let Some(through) = appended.compacted_through {
				self.inner.search.drop_through(conversation, through);
			}
			if let Err(err) = self
				.inner
				.registry
				.touch_activity(conversation, message.created_at_unix_ms)
				.await
			{
				warn!(conversation_id = %conversation, error = %err, "gateway: activity update failed");
			}
			if let Err(err) = self.inner.registry.mark_read(conversation, &handle.user_id, message.seq).await {
				warn!(conversation_id = %conversation, error = %err, "gateway: sender read cursor update failed");
			}
		}

		Ok(SendAccepted {
			message: appended.message,
			duplicate: appended.duplicate,
		})
	}

	/// Append a revision of `target_seq`. Only its sender may edit.
	pub async fn edit(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		target_seq: Seq,
		content: &str,
		token: IdempotencyToken,
	) -> Result<SendAccepted, GatewayError> {
		self.member_of(handle, conversation)?;
		let target = self.inner.log.get(conversation, target_seq).await?;
		if target.deleted {
			return Err(GatewayError::UnknownMessage { seq: target_seq });
		}
		if target.sender_id != handle.user_id {
			return Err(GatewayError::Forbidden(format!("message {target_seq} belongs to another user")));
		}

		let result = self
			.append_message(handle, conversation, content, token, Some(target_seq))
			.await;
		if let Err(rejection) = &result {
			metrics::counter!("parley_server_send_rejected_total", "reason" => rejection.reason()).increment(1);
		}
		Ok(result?)
	}

	/// Soft-delete a message. Only its sender may delete; repeating is a no-op.
	pub async fn delete_message(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		seq: Seq,
	) -> Result<Message, GatewayError> {
		self.member_of(handle, conversation)?;
		let target = self.inner.log.get(conversation, seq).await?;
		if target.sender_id != handle.user_id {
			return Err(GatewayError::Forbidden(format!("message {seq} belongs to another user")));
		}
		if target.deleted {
			return Ok(target);
		}

		let router = &self.inner.router;
		let (message, report) = self
			.inner
			.log
			.delete_and_then(conversation, seq, |m| {
				router.publish(
					conversation,
					FanoutEvent::MessageDeleted {
						conversation_id: m.conversation_id.clone(),
						seq: m.seq,
					},
				)
			})
			.await?;
		self.drop_evicted(report.evicted);
		self.inner.search.remove(conversation, seq);
		debug!(conversation_id = %conversation, seq, "gateway: message deleted");
		Ok(message)
	}

	/// Start live delivery for `conversation` on this connection.
	///
	/// Live events may arrive before a catch-up opened afterwards has finished;
	/// callers deduplicate by seq.
	pub async fn subscribe(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
	) -> Result<SubscriptionInfo, GatewayError> {
		self.member_of(handle, conversation)?;
		if !self.inner.router.subscribe(handle.conn_id, conversation) {
			return Err(SendRejection::UnknownConnection.into());
		}
		let head_seq = self.inner.log.head(conversation).await?;
		let oldest_available = self.inner.log.oldest_available(conversation).await?;
		debug!(conn_id = %handle.conn_id, conversation_id = %conversation, head_seq, "gateway: subscribed");
		Ok(SubscriptionInfo {
			head_seq,
			oldest_available,
		})
	}

	pub fn unsubscribe(&self, handle: &ConnectionHandle, conversation: &ConversationId) {
		self.inner.router.unsubscribe(handle.conn_id, conversation);
	}

	/// Messages after `after_seq` up to the current head, then a `CaughtUp` marker.
	pub async fn catch_up(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		after_seq: Seq,
	) -> Result<CatchUpFeed, GatewayError> {
		self.member_of(handle, conversation)?;
		let catch_up = self.inner.log.read_since(conversation, after_seq).await?;
		let head_seq = catch_up.head_seq;

		let items = catch_up
			.messages
			.map_ok(CatchUpItem::Message)
			.map_err(GatewayError::from)
			.chain(stream::once(async move { Ok(CatchUpItem::CaughtUp { head_seq }) }))
			.boxed();

		Ok(CatchUpFeed {
			head_seq,
			oldest_available: catch_up.oldest_available,
			items,
		})
	}

	pub async fn create_direct(&self, handle: &ConnectionHandle, peer: &UserId) -> Result<Conversation, GatewayError> {
		let (conversation, created) = self
			.inner
			.registry
			.create_direct(&handle.user_id, peer, unix_ms_now())
			.await?;
		if created {
			info!(conversation_id = %conversation.id, user_id = %handle.user_id, peer = %peer, "gateway: direct conversation created");
		}
		Ok(conversation)
	}

	pub async fn create_group(
		&self,
		handle: &ConnectionHandle,
		members: Vec<UserId>,
		title: Option<String>,
	) -> Result<Conversation, GatewayError> {
		let conversation = self
			.inner
			.registry
			.create_group(&handle.user_id, members, title, unix_ms_now())
			.await?;
		info!(conversation_id = %conversation.id, members = conversation.members.len(), "gateway: group created");
		Ok(conversation)
	}

	pub async fn add_member(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		user: &UserId,
	) -> Result<Conversation, GatewayError> {
		Ok(self
			.inner
			.registry
			.add_member(conversation, &handle.user_id, user, unix_ms_now())
			.await?)
	}

	pub async fn remove_member(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		user: &UserId,
	) -> Result<Conversation, GatewayError> {
		let updated = self
			.inner
			.registry
			.remove_member(conversation, &handle.user_id, user)
			.await?;
		self.inner.router.unsubscribe_user(user, conversation);
		Ok(updated)
	}

	pub async fn archive(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		archived: bool,
	) -> Result<Conversation, GatewayError> {
		Ok(self
			.inner
			.registry
			.set_archived(conversation, &handle.user_id, archived)
			.await?)
	}

	/// One page of the caller's conversations, optionally filtered.
	///
	/// The filter matches title, last message or member display names,
	/// case-insensitively. Filtering happens while paging, so a page may
	/// scan further than `limit` conversations.
	pub async fn list_conversations(
		&self,
		handle: &ConnectionHandle,
		cursor: Option<&str>,
		limit: usize,
		filter: Option<&str>,
	) -> Result<ConversationListing, GatewayError> {
		let limit = limit.clamp(1, 200);
		let filter = filter.map(str::trim).filter(|f| !f.is_empty());
		let mut cursor = match cursor.map(str::trim).filter(|c| !c.is_empty()) {
			Some(raw) => Some(PageCursor::decode(raw)?),
			None => None,
		};

		let mut items = Vec::new();
		loop {
			let page = self.inner.registry.page_for(&handle.user_id, cursor.as_ref(), limit);
			let last_page = page.next_cursor.is_none();
			let page_len = page.items.len();

			for (idx, conversation) in page.items.into_iter().enumerate() {
				cursor = Some(PageCursor::of(&conversation));
				let view = self.view_of(&handle.user_id, conversation).await?;
				if filter.is_none_or(|f| view.matches(f)) {
					items.push(view);
				}
				if items.len() == limit {
					let exhausted = last_page && idx + 1 == page_len;
					return Ok(ConversationListing {
						items,
						next_cursor: if exhausted { None } else { cursor.map(|c| c.encode()) },
					});
				}
			}

			if last_page {
				return Ok(ConversationListing {
					items,
					next_cursor: None,
				});
			}
		}
	}

	async fn view_of(&self, viewer: &UserId, conversation: Conversation) -> Result<ConversationView, GatewayError> {
		let head_seq = self.inner.log.head(&conversation.id).await?;
		let last_message = self.inner.log.last_message(&conversation.id).await?;
		let last_read = conversation.member(viewer).map(|m| m.last_read_seq).unwrap_or(0);

		let members = conversation
			.member_ids()
			.map(|id| MemberView {
				profile: self.inner.profiles.get(id),
				presence: self.inner.presence.status(id),
			})
			.collect();

		Ok(ConversationView {
			members,
			last_message,
			unread_count: head_seq.saturating_sub(last_read),
			head_seq,
			conversation,
		})
	}

	/// Advance the caller's read cursor, clamped to the head. Returns the effective cursor.
	pub async fn mark_read(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		seq: Seq,
	) -> Result<Seq, GatewayError> {
		self.member_of(handle, conversation)?;
		let head = self.inner.log.head(conversation).await?;
		Ok(self
			.inner
			.registry
			.mark_read(conversation, &handle.user_id, seq.min(head))
			.await?)
	}

	pub async fn search(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		query: &str,
		limit: usize,
	) -> Result<Vec<Message>, GatewayError> {
		self.member_of(handle, conversation)?;
		Ok(self
			.inner
			.search
			.search_with_rebuild(&self.inner.log, conversation, query, limit)
			.await?)
	}

	/// Watch `target`'s presence. Allowed only for users sharing a conversation.
	pub fn watch_presence(&self, handle: &ConnectionHandle, target: &UserId) -> Result<PresenceSnapshot, GatewayError> {
		if !self.inner.registry.shares_conversation(&handle.user_id, target) {
			return Err(GatewayError::Forbidden(format!("no shared conversation with {target}")));
		}
		self.inner.presence.subscribe_to_presence(&handle.user_id, target);
		Ok(self.inner.presence.status(target))
	}

	/// Explicitly delete history up to and including `through`.
	pub async fn purge_history(
		&self,
		handle: &ConnectionHandle,
		conversation: &ConversationId,
		through: Seq,
	) -> Result<u64, GatewayError> {
		self.member_of(handle, conversation)?;
		let purged = self.inner.log.purge_history(conversation, through).await?;
		self.inner.search.drop_through(conversation, through);
		info!(conversation_id = %conversation, through, purged, user_id = %handle.user_id, "gateway: history purged");
		Ok(purged)
	}

	/// Disconnect every connection idle for longer than `idle_timeout`.
	pub fn reap_idle(&self, now: Instant) -> usize {
		let idle = self.inner.presence.idle_connections(now, self.inner.cfg.idle_timeout);
		let count = idle.len();
		for (user_id, conn_id) in idle {
			info!(%conn_id, user_id = %user_id, "gateway: idle timeout");
			self.disconnect(&ConnectionHandle { conn_id, user_id });
		}
		count
	}

	pub fn spawn_idle_reaper(&self) -> tokio::task::JoinHandle<()> {
		let gateway = self.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(gateway.inner.cfg.reaper_interval);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tick.tick().await;
				gateway.reap_idle(Instant::now());
			}
		})
	}
}
