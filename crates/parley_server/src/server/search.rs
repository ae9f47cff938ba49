#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parley_domain::{ConversationId, Message, Seq};
use tokio::sync::Mutex;
use tracing::debug;

use crate::server::log::{DeliveryLog, LogError};

#[derive(Debug, Clone)]
struct IndexedMessage {
	folded: String,
	message: Message,
}

/// Removals seen while a rebuild is reading the log.
#[derive(Debug, Default)]
struct BuildChanges {
	removed: HashSet<Seq>,
	dropped_through: Seq,
}

#[derive(Debug, Default)]
struct ConversationIndex {
	entries: BTreeMap<Seq, IndexedMessage>,
	building: Option<BuildChanges>,
}

/// Per-conversation substring index over message content.
///
/// Derived state: a conversation is indexed lazily from the delivery log on
/// its first search and kept current by [`SearchIndex::index`] afterwards.
/// Concurrent first searches wait for the one build.
#[derive(Debug, Default)]
pub struct SearchIndex {
	conversations: DashMap<ConversationId, ConversationIndex>,
	/// Held across a build; `true` once the conversation is indexed.
	builds: DashMap<ConversationId, Arc<Mutex<bool>>>,
}

impl SearchIndex {
	pub fn new() -> Self {
		Self::default()
	}

	/// `false` while the first build is still running.
	pub fn is_indexed(&self, conversation: &ConversationId) -> bool {
		self.builds
			.get(conversation)
			.is_some_and(|built| built.try_lock().is_ok_and(|built| *built))
	}

	fn build_lock(&self, conversation: &ConversationId) -> Arc<Mutex<bool>> {
		self.builds.entry(conversation.clone()).or_default().clone()
	}

	/// Add a new message. No-op until a build has started for the conversation.
	pub fn index(&self, message: &Message) {
		if message.deleted {
			return;
		}
		if let Some(mut index) = self.conversations.get_mut(&message.conversation_id) {
			index.entries.insert(
				message.seq,
				IndexedMessage {
					folded: message.content.to_lowercase(),
					message: message.clone(),
				},
			);
		}
	}

	pub fn remove(&self, conversation: &ConversationId, seq: Seq) {
		if let Some(mut index) = self.conversations.get_mut(conversation) {
			index.entries.remove(&seq);
			if let Some(changes) = index.building.as_mut() {
				changes.removed.insert(seq);
			}
		}
	}

	/// Forget purged or compacted history.
	pub fn drop_through(&self, conversation: &ConversationId, through: Seq) {
		if let Some(mut index) = self.conversations.get_mut(conversation) {
			let kept = index.entries.split_off(&(through.saturating_add(1)));
			index.entries = kept;
			if let Some(changes) = index.building.as_mut() {
				changes.dropped_through = changes.dropped_through.max(through);
			}
		}
	}

	pub fn clear(&self, conversation: &ConversationId) {
		self.conversations.remove(conversation);
		self.builds.remove(conversation);
	}

	/// Rebuild one conversation from the delivery log alone.
	pub async fn rebuild(&self, log: &DeliveryLog, conversation: &ConversationId) -> Result<usize, LogError> {
		let lock = self.build_lock(conversation);
		let mut built = lock.lock().await;
		let count = self.build(log, conversation).await?;
		*built = true;
		Ok(count)
	}

	/// Caller holds the conversation's build lock.
	async fn build(&self, log: &DeliveryLog, conversation: &ConversationId) -> Result<usize, LogError> {
		// Live appends and removals land in the entry while the log is read.
		self.conversations.entry(conversation.clone()).or_default().building = Some(BuildChanges::default());

		let read = async {
			let head = log.head(conversation).await?;
			let messages = log.read_range(conversation, 1, head).await?;
			Ok::<_, LogError>((head, messages))
		}
		.await;

		let mut index = self.conversations.entry(conversation.clone()).or_default();
		let changes = index.building.take().unwrap_or_default();
		let (head, messages) = read?;

		let mut entries: BTreeMap<Seq, IndexedMessage> = messages
			.into_iter()
			.filter(|m| !m.deleted && m.seq > changes.dropped_through && !changes.removed.contains(&m.seq))
			.map(|m| {
				(
					m.seq,
					IndexedMessage {
						folded: m.content.to_lowercase(),
						message: m,
					},
				)
			})
			.collect();
		let count = entries.len();

		let live = std::mem::take(&mut index.entries);
		entries.extend(live.into_iter().filter(|(seq, _)| *seq > head));
		index.entries = entries;
		drop(index);

		debug!(conversation_id = %conversation, messages = count, "search: index rebuilt");
		Ok(count)
	}

	/// Messages whose content contains `query`, case-insensitively, in seq order.
	///
	/// An empty or whitespace-only query matches nothing. `limit` of `0` means unbounded.
	pub fn search(&self, conversation: &ConversationId, query: &str, limit: usize) -> Vec<Message> {
		if query.trim().is_empty() {
			return Vec::new();
		}
		let needle = query.to_lowercase();
		let Some(index) = self.conversations.get(conversation) else {
			return Vec::new();
		};

		let limit = if limit == 0 { usize::MAX } else { limit };
		index
			.entries
			.values()
			.filter(|e| e.folded.contains(&needle))
			.take(limit)
			.map(|e| e.message.clone())
			.collect()
	}

	/// Search, building the conversation's index first if needed.
	pub async fn search_with_rebuild(
		&self,
		log: &DeliveryLog,
		conversation: &ConversationId,
		query: &str,
		limit: usize,
	) -> Result<Vec<Message>, LogError> {
		let lock = self.build_lock(conversation);
		let mut built = lock.lock().await;
		if !*built {
			self.build(log, conversation).await?;
			*built = true;
		}
		drop(built);
		Ok(self.search(conversation, query, limit))
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use async_trait::async_trait;
	use parley_domain::{IdempotencyToken, UserId};

	use super::*;
	use crate::server::log::{AppendRequest, InMemoryLogBackend, LogBackend, LogConfig};

	/// Range reads return a snapshot, then stall before handing it back.
	#[derive(Default)]
	struct SlowReads {
		inner: InMemoryLogBackend,
	}

	#[async_trait]
	impl LogBackend for SlowReads {
		async fn find_by_token(
			&self,
			conversation: &ConversationId,
			sender: &UserId,
			token: &IdempotencyToken,
			not_before_unix_ms: i64,
		) -> anyhow::Result<Option<Message>> {
			self.inner.find_by_token(conversation, sender, token, not_before_unix_ms).await
		}

		async fn append(&self, request: &AppendRequest) -> anyhow::Result<Message> {
			self.inner.append(request).await
		}

		async fn read_range(
			&self,
			conversation: &ConversationId,
			from: Seq,
			to: Seq,
			limit: usize,
		) -> anyhow::Result<Vec<Message>> {
			let messages = self.inner.read_range(conversation, from, to, limit).await?;
			tokio::time::sleep(Duration::from_millis(100)).await;
			Ok(messages)
		}

		async fn head(&self, conversation: &ConversationId) -> anyhow::Result<Seq> {
			self.inner.head(conversation).await
		}

		async fn oldest_available(&self, conversation: &ConversationId) -> anyhow::Result<Seq> {
			self.inner.oldest_available(conversation).await
		}

		async fn get(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<Option<Message>> {
			self.inner.get(conversation, seq).await
		}

		async fn mark_deleted(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<bool> {
			self.inner.mark_deleted(conversation, seq).await
		}

		async fn purge_through(&self, conversation: &ConversationId, through: Seq) -> anyhow::Result<u64> {
			self.inner.purge_through(conversation, through).await
		}

		async fn last_message(&self, conversation: &ConversationId) -> anyhow::Result<Option<Message>> {
			self.inner.last_message(conversation).await
		}
	}

	fn slow_log() -> DeliveryLog {
		DeliveryLog::new(Arc::new(SlowReads::default()), LogConfig::default())
	}

	fn conv() -> ConversationId {
		ConversationId::new("c1").unwrap()
	}

	async fn append(log: &DeliveryLog, content: &str) -> Message {
		log.append(AppendRequest {
			conversation_id: conv(),
			sender_id: UserId::new("alice").unwrap(),
			content: content.to_string(),
			idempotency_token: IdempotencyToken::none(),
			revises: None,
			created_at_unix_ms: 1,
		})
		.await
		.unwrap()
		.message
	}

	fn seqs(messages: &[Message]) -> Vec<Seq> {
		messages.iter().map(|m| m.seq).collect()
	}

	#[tokio::test]
	async fn case_insensitive_substring_in_seq_order() {
		let log = DeliveryLog::in_memory(LogConfig::default());
		append(&log, "Hello there").await;
		append(&log, "nothing here").await;
		append(&log, "say HELLO again").await;

		let index = SearchIndex::new();
		let hits = index.search_with_rebuild(&log, &conv(), "hello", 0).await.unwrap();
		assert_eq!(seqs(&hits), vec![1, 3]);

		let limited = index.search(&conv(), "hello", 1);
		assert_eq!(seqs(&limited), vec![1]);
	}

	#[tokio::test]
	async fn blank_queries_match_nothing() {
		let log = DeliveryLog::in_memory(LogConfig::default());
		append(&log, "  spaced  ").await;
		let index = SearchIndex::new();
		index.rebuild(&log, &conv()).await.unwrap();

		assert!(index.search(&conv(), "", 0).is_empty());
		assert!(index.search(&conv(), "   ", 0).is_empty());
		// Non-blank queries are matched as typed, surrounding spaces included.
		assert_eq!(seqs(&index.search(&conv(), " spaced ", 0)), vec![1]);
	}

	#[tokio::test]
	async fn incremental_updates_and_removals() {
		let log = DeliveryLog::in_memory(LogConfig::default());
		append(&log, "Straße").await;
		let index = SearchIndex::new();
		index.rebuild(&log, &conv()).await.unwrap();

		let second = append(&log, "STRASSE or straße").await;
		index.index(&second);
		assert_eq!(seqs(&index.search(&conv(), "STRAßE", 0)), vec![1, 2]);

		index.remove(&conv(), 1);
		assert_eq!(seqs(&index.search(&conv(), "straße", 0)), vec![2]);

		index.drop_through(&conv(), 2);
		assert!(index.search(&conv(), "straße", 0).is_empty());
	}

	#[test]
	fn unindexed_conversation_ignores_live_updates() {
		let index = SearchIndex::new();
		index.index(&Message {
			conversation_id: conv(),
			seq: 1,
			sender_id: UserId::new("alice").unwrap(),
			content: "hi".into(),
			created_at_unix_ms: 0,
			idempotency_token: IdempotencyToken::none(),
			deleted: false,
			revises: None,
		});
		assert!(!index.is_indexed(&conv()));
	}

	#[tokio::test]
	async fn overlapping_first_searches_wait_for_one_build() {
		let log = slow_log();
		append(&log, "hello there").await;
		let index = SearchIndex::new();

		let (c1, c2) = (conv(), conv());
		let (first, second) = tokio::join!(
			index.search_with_rebuild(&log, &c1, "hello", 0),
			index.search_with_rebuild(&log, &c2, "hello", 0),
		);
		assert_eq!(seqs(&first.unwrap()), vec![1]);
		assert_eq!(seqs(&second.unwrap()), vec![1]);
		assert!(index.is_indexed(&conv()));
	}

	#[tokio::test]
	async fn changes_during_a_build_are_kept() {
		let log = slow_log();
		append(&log, "hello one").await;
		append(&log, "hello two").await;
		append(&log, "hello three").await;
		let index = SearchIndex::new();

		let changes = async {
			tokio::time::sleep(Duration::from_millis(20)).await;
			assert!(!index.is_indexed(&conv()));
			log.delete_and_then(&conv(), 2, |m| index.remove(&m.conversation_id, m.seq))
				.await
				.unwrap();
			let fourth = append(&log, "hello four").await;
			index.index(&fourth);
		};
		let c = conv();
		let (hits, ()) = tokio::join!(index.search_with_rebuild(&log, &c, "hello", 0), changes);
		assert_eq!(seqs(&hits.unwrap()), vec![1, 3, 4]);
	}
}
