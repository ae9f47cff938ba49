#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parley_domain::{ConversationId, IdempotencyToken, Message, Seq, UserId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LogConfig {
	/// Messages fetched per backend round-trip during catch-up.
	pub page_size: usize,
	/// Keep at most this many messages per conversation; older ones are compacted.
	pub hot_capacity: Option<usize>,
	pub idempotency_window: Duration,
}

impl Default for LogConfig {
	fn default() -> Self {
		Self {
			page_size: 256,
			hot_capacity: None,
			idempotency_window: Duration::from_secs(24 * 60 * 60),
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
	#[error("idempotency token already used by seq {seq} with different content")]
	Conflict { seq: Seq },

	#[error("message {seq} not found")]
	NotFound { seq: Seq },

	#[error("delivery log unavailable: {0}")]
	Unavailable(String),
}

impl LogError {
	fn unavailable(err: anyhow::Error) -> Self {
		LogError::Unavailable(format!("{err:#}"))
	}
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub content: String,
	pub idempotency_token: IdempotencyToken,
	pub revises: Option<Seq>,
	pub created_at_unix_ms: i64,
}

#[derive(Debug, Clone)]
pub struct Appended {
	pub message: Message,
	/// The token matched an earlier append; `message` is that original.
	pub duplicate: bool,
	/// Set when this append pushed older messages out of the hot window.
	pub compacted_through: Option<Seq>,
}

/// Durable storage behind the delivery log.
///
/// Implementations never retry; the log maps every error to
/// [`LogError::Unavailable`].
#[async_trait]
pub trait LogBackend: Send + Sync {
	/// Latest message from `sender` carrying `token`, created at or after `not_before_unix_ms`.
	async fn find_by_token(
		&self,
		conversation: &ConversationId,
		sender: &UserId,
		token: &IdempotencyToken,
		not_before_unix_ms: i64,
	) -> anyhow::Result<Option<Message>>;

	/// Allocate the next seq and store the message. Returns after commit.
	async fn append(&self, request: &AppendRequest) -> anyhow::Result<Message>;

	/// Messages with `from <= seq <= to`, ascending, at most `limit`.
	async fn read_range(&self, conversation: &ConversationId, from: Seq, to: Seq, limit: usize)
	-> anyhow::Result<Vec<Message>>;

	async fn head(&self, conversation: &ConversationId) -> anyhow::Result<Seq>;

	/// Lowest retained seq, or `head + 1` when nothing is retained.
	async fn oldest_available(&self, conversation: &ConversationId) -> anyhow::Result<Seq>;

	async fn get(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<Option<Message>>;

	/// Returns `false` if the message does not exist.
	async fn mark_deleted(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<bool>;

	/// Physically drop messages with `seq <= through`. The head is kept.
	async fn purge_through(&self, conversation: &ConversationId, through: Seq) -> anyhow::Result<u64>;

	/// Newest message that is not soft-deleted.
	async fn last_message(&self, conversation: &ConversationId) -> anyhow::Result<Option<Message>>;
}

#[derive(Debug, Default)]
struct ConversationLog {
	head: Seq,
	messages: BTreeMap<Seq, Message>,
	tokens: HashMap<(UserId, IdempotencyToken), Seq>,
	/// Token registrations in append order, for expiry.
	token_ages: VecDeque<(i64, Seq, (UserId, IdempotencyToken))>,
}

impl ConversationLog {
	/// Forget tokens registered before `cutoff_unix_ms`.
	fn expire_tokens(&mut self, cutoff_unix_ms: i64) {
		while let Some((created_at, _, _)) = self.token_ages.front() {
			if *created_at >= cutoff_unix_ms {
				break;
			}
			let Some((_, seq, key)) = self.token_ages.pop_front() else {
				break;
			};
			// A later append may have re-registered the same token.
			if self.tokens.get(&key) == Some(&seq) {
				self.tokens.remove(&key);
			}
		}
	}
}

#[derive(Debug)]
pub struct InMemoryLogBackend {
	logs: DashMap<ConversationId, ConversationLog>,
	token_window: Duration,
}

impl Default for InMemoryLogBackend {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryLogBackend {
	pub fn new() -> Self {
		Self::with_token_window(LogConfig::default().idempotency_window)
	}

	/// Tokens older than `window` are dropped as new messages arrive.
	pub fn with_token_window(window: Duration) -> Self {
		Self {
			logs: DashMap::new(),
			token_window: window,
		}
	}

	#[cfg(test)]
	pub(crate) fn token_count(&self, conversation: &ConversationId) -> usize {
		self.logs.get(conversation).map(|log| log.tokens.len()).unwrap_or(0)
	}
}

#[async_trait]
impl LogBackend for InMemoryLogBackend {
	async fn find_by_token(
		&self,
		conversation: &ConversationId,
		sender: &UserId,
		token: &IdempotencyToken,
		not_before_unix_ms: i64,
	) -> anyhow::Result<Option<Message>> {
		let Some(log) = self.logs.get(conversation) else {
			return Ok(None);
		};
		let found = log
			.tokens
			.get(&(sender.clone(), token.clone()))
			.and_then(|seq| log.messages.get(seq))
			.filter(|m| m.created_at_unix_ms >= not_before_unix_ms)
			.cloned();
		Ok(found)
	}

	async fn append(&self, request: &AppendRequest) -> anyhow::Result<Message> {
		let mut log = self.logs.entry(request.conversation_id.clone()).or_default();
		log.head += 1;
		let message = Message {
			conversation_id: request.conversation_id.clone(),
			seq: log.head,
			sender_id: request.sender_id.clone(),
			content: request.content.clone(),
			created_at_unix_ms: request.created_at_unix_ms,
			idempotency_token: request.idempotency_token.clone(),
			deleted: false,
			revises: request.revises,
		};
		let window_ms = i64::try_from(self.token_window.as_millis()).unwrap_or(i64::MAX);
		log.expire_tokens(request.created_at_unix_ms.saturating_sub(window_ms));
		if !request.idempotency_token.is_empty() {
			let key = (request.sender_id.clone(), request.idempotency_token.clone());
			log.tokens.insert(key.clone(), message.seq);
			log.token_ages.push_back((request.created_at_unix_ms, message.seq, key));
		}
		log.messages.insert(message.seq, message.clone());
		Ok(message)
	}

	async fn read_range(
		&self,
		conversation: &ConversationId,
		from: Seq,
		to: Seq,
		limit: usize,
	) -> anyhow::Result<Vec<Message>> {
		if from > to {
			return Ok(Vec::new());
		}
		let Some(log) = self.logs.get(conversation) else {
			return Ok(Vec::new());
		};
		Ok(log.messages.range(from..=to).take(limit).map(|(_, m)| m.clone()).collect())
	}

	async fn head(&self, conversation: &ConversationId) -> anyhow::Result<Seq> {
		Ok(self.logs.get(conversation).map(|log| log.head).unwrap_or(0))
	}

	async fn oldest_available(&self, conversation: &ConversationId) -> anyhow::Result<Seq> {
		Ok(self
			.logs
			.get(conversation)
			.map(|log| log.messages.keys().next().copied().unwrap_or(log.head + 1))
			.unwrap_or(1))
	}

	async fn get(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<Option<Message>> {
		Ok(self.logs.get(conversation).and_then(|log| log.messages.get(&seq).cloned()))
	}

	async fn mark_deleted(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<bool> {
		let Some(mut log) = self.logs.get_mut(conversation) else {
			return Ok(false);
		};
		match log.messages.get_mut(&seq) {
			Some(message) => {
				message.deleted = true;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn purge_through(&self, conversation: &ConversationId, through: Seq) -> anyhow::Result<u64> {
		let Some(mut log) = self.logs.get_mut(conversation) else {
			return Ok(0);
		};
		let kept = log.messages.split_off(&(through.saturating_add(1)));
		let purged = std::mem::replace(&mut log.messages, kept).len() as u64;
		log.tokens.retain(|_, seq| *seq > through);
		log.token_ages.retain(|(_, seq, _)| *seq > through);
		Ok(purged)
	}

	async fn last_message(&self, conversation: &ConversationId) -> anyhow::Result<Option<Message>> {
		Ok(self
			.logs
			.get(conversation)
			.and_then(|log| log.messages.values().rev().find(|m| !m.deleted).cloned()))
	}
}

/// Catch-up over a conversation, bounded by the head seen when it was opened.
pub struct CatchUp {
	pub head_seq: Seq,
	pub oldest_available: Seq,
	pub messages: BoxStream<'static, Result<Message, LogError>>,
}

/// Per-conversation sequencer in front of a [`LogBackend`].
pub struct DeliveryLog {
	backend: Arc<dyn LogBackend>,
	sequencers: DashMap<ConversationId, Arc<Mutex<()>>>,
	cfg: LogConfig,
}

impl DeliveryLog {
	pub fn new(backend: Arc<dyn LogBackend>, cfg: LogConfig) -> Self {
		Self {
			backend,
			sequencers: DashMap::new(),
			cfg,
		}
	}

	pub fn in_memory(cfg: LogConfig) -> Self {
		Self::new(Arc::new(InMemoryLogBackend::with_token_window(cfg.idempotency_window)), cfg)
	}

	pub fn config(&self) -> &LogConfig {
		&self.cfg
	}

	fn sequencer(&self, conversation: &ConversationId) -> Arc<Mutex<()>> {
		self.sequencers.entry(conversation.clone()).or_default().clone()
	}

	pub async fn append(&self, request: AppendRequest) -> Result<Appended, LogError> {
		self.append_and_then(request, |_| ()).await.map(|(appended, _)| appended)
	}

	/// Append and run `publish` on the new message while still holding the
	/// conversation's sequencer, so publication order equals seq order.
	///
	/// `publish` is not called for duplicates.
	pub async fn append_and_then<R>(
		&self,
		request: AppendRequest,
		publish: impl FnOnce(&Message) -> R,
	) -> Result<(Appended, Option<R>), LogError> {
		let sequencer = self.sequencer(&request.conversation_id);
		let _guard = sequencer.lock().await;

		if !request.idempotency_token.is_empty() {
			let not_before = request
				.created_at_unix_ms
				.saturating_sub(self.cfg.idempotency_window.as_millis() as i64);
			let prior = self
				.backend
				.find_by_token(
					&request.conversation_id,
					&request.sender_id,
					&request.idempotency_token,
					not_before,
				)
				.await
				.map_err(LogError::unavailable)?;

			if let Some(prior) = prior {
				if prior.content != request.content || prior.revises != request.revises {
					return Err(LogError::Conflict { seq: prior.seq });
				}
				metrics::counter!("parley_server_messages_duplicate_total").increment(1);
				debug!(
					conversation_id = %request.conversation_id,
					seq = prior.seq,
					token = %request.idempotency_token,
					"log: duplicate append suppressed"
				);
				return Ok((
					Appended {
						message: prior,
						duplicate: true,
						compacted_through: None,
					},
					None,
				));
			}
		}

		let message = self.backend.append(&request).await.map_err(LogError::unavailable)?;
		metrics::counter!("parley_server_messages_appended_total").increment(1);
		debug!(conversation_id = %message.conversation_id, seq = message.seq, "log: appended");

		let published = publish(&message);

		let compacted_through = match self.cfg.hot_capacity {
			Some(capacity) if message.seq > capacity as Seq => {
				let through = message.seq - capacity as Seq;
				match self.backend.purge_through(&message.conversation_id, through).await {
					Ok(_) => Some(through),
					Err(err) => {
						warn!(conversation_id = %message.conversation_id, error = %format!("{err:#}"), "log: compaction failed");
						None
					}
				}
			}
			_ => None,
		};

		Ok((
			Appended {
				message,
				duplicate: false,
				compacted_through,
			},
			Some(published),
		))
	}

	/// Soft-delete `seq`, running `publish` under the sequencer.
	pub async fn delete_and_then<R>(
		&self,
		conversation: &ConversationId,
		seq: Seq,
		publish: impl FnOnce(&Message) -> R,
	) -> Result<(Message, R), LogError> {
		let sequencer = self.sequencer(conversation);
		let _guard = sequencer.lock().await;

		if !self
			.backend
			.mark_deleted(conversation, seq)
			.await
			.map_err(LogError::unavailable)?
		{
			return Err(LogError::NotFound { seq });
		}
		let message = self
			.backend
			.get(conversation, seq)
			.await
			.map_err(LogError::unavailable)?
			.ok_or(LogError::NotFound { seq })?;
		let published = publish(&message);
		Ok((message, published))
	}

	/// Explicit history deletion of every message up to `through`.
	pub async fn purge_history(&self, conversation: &ConversationId, through: Seq) -> Result<u64, LogError> {
		let sequencer = self.sequencer(conversation);
		let _guard = sequencer.lock().await;
		let purged = self
			.backend
			.purge_through(conversation, through)
			.await
			.map_err(LogError::unavailable)?;
		debug!(conversation_id = %conversation, through, purged, "log: history purged");
		Ok(purged)
	}

	/// All retained messages with `from <= seq <= to`.
	pub async fn read_range(&self, conversation: &ConversationId, from: Seq, to: Seq) -> Result<Vec<Message>, LogError> {
		let mut out = Vec::new();
		let mut next = from.max(1);
		while next <= to {
			let page = self
				.backend
				.read_range(conversation, next, to, self.cfg.page_size.max(1))
				.await
				.map_err(LogError::unavailable)?;
			let Some(last) = page.last() else {
				break;
			};
			next = last.seq + 1;
			out.extend(page);
		}
		Ok(out)
	}

	/// Lazy, restartable catch-up of everything after `after_seq`.
	pub async fn read_since(&self, conversation: &ConversationId, after_seq: Seq) -> Result<CatchUp, LogError> {
		let head_seq = self.head(conversation).await?;
		let oldest_available = self.oldest_available(conversation).await?;

		let backend = Arc::clone(&self.backend);
		let conversation = conversation.clone();
		let page_size = self.cfg.page_size.max(1);
		let start = after_seq.saturating_add(1);

		let pages = stream::try_unfold(start, move |next| {
			let backend = Arc::clone(&backend);
			let conversation = conversation.clone();
			async move {
				if next > head_seq {
					return Ok::<_, LogError>(None);
				}
				let page = backend
					.read_range(&conversation, next, head_seq, page_size)
					.await
					.map_err(LogError::unavailable)?;
				match page.last().map(|m| m.seq + 1) {
					Some(after_page) => Ok(Some((page, after_page))),
					None => Ok(None),
				}
			}
		});

		let messages = pages
			.map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, LogError>)))
			.try_flatten()
			.boxed();

		Ok(CatchUp {
			head_seq,
			oldest_available,
			messages,
		})
	}

	pub async fn head(&self, conversation: &ConversationId) -> Result<Seq, LogError> {
		self.backend.head(conversation).await.map_err(LogError::unavailable)
	}

	pub async fn oldest_available(&self, conversation: &ConversationId) -> Result<Seq, LogError> {
		self.backend
			.oldest_available(conversation)
			.await
			.map_err(LogError::unavailable)
	}

	pub async fn get(&self, conversation: &ConversationId, seq: Seq) -> Result<Message, LogError> {
		self.backend
			.get(conversation, seq)
			.await
			.map_err(LogError::unavailable)?
			.ok_or(LogError::NotFound { seq })
	}

	pub async fn last_message(&self, conversation: &ConversationId) -> Result<Option<Message>, LogError> {
		self.backend.last_message(conversation).await.map_err(LogError::unavailable)
	}
}
