#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use parley_domain::{Conversation, ConversationId, ConversationKind, DirectKey, Member, Seq, UserId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("unknown conversation: {0}")]
	UnknownConversation(ConversationId),

	#[error("{user} is not a member of {conversation}")]
	NotAMember { conversation: ConversationId, user: UserId },

	#[error("invalid members: {0}")]
	InvalidMembers(String),

	#[error("operation requires a group conversation")]
	NotAGroup,

	#[error("invalid page cursor")]
	InvalidCursor,

	#[error("storage unavailable: {0}")]
	Storage(String),
}

impl RegistryError {
	fn storage(err: anyhow::Error) -> Self {
		RegistryError::Storage(format!("{err:#}"))
	}
}

/// Result of a durable conversation insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
	Inserted,
	/// A direct conversation for the same pair already exists in storage.
	Existing(ConversationId),
}

/// Write-through persistence for the registry.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
	async fn load_all(&self) -> anyhow::Result<Vec<Conversation>>;

	async fn load_conversation(&self, id: &ConversationId) -> anyhow::Result<Option<Conversation>>;

	async fn insert_conversation(
		&self,
		conversation: &Conversation,
		direct_key: Option<&DirectKey>,
	) -> anyhow::Result<InsertOutcome>;

	async fn add_member(&self, conversation: &ConversationId, member: &Member) -> anyhow::Result<()>;

	async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> anyhow::Result<()>;

	/// Archive state is per member.
	async fn set_archived(&self, conversation: &ConversationId, user: &UserId, archived: bool) -> anyhow::Result<()>;

	/// Raise the member's read cursor to `seq`; never lowers it.
	async fn set_last_read(&self, conversation: &ConversationId, user: &UserId, seq: Seq) -> anyhow::Result<()>;

	async fn touch_activity(&self, conversation: &ConversationId, at_unix_ms: i64) -> anyhow::Result<()>;
}

/// Backend for deployments without persistence; state lives only in the registry maps.
#[derive(Debug, Default)]
pub struct VolatileRegistryBackend;

#[async_trait]
impl RegistryBackend for VolatileRegistryBackend {
	async fn load_all(&self) -> anyhow::Result<Vec<Conversation>> {
		Ok(Vec::new())
	}

	async fn load_conversation(&self, _id: &ConversationId) -> anyhow::Result<Option<Conversation>> {
		Ok(None)
	}

	async fn insert_conversation(
		&self,
		_conversation: &Conversation,
		_direct_key: Option<&DirectKey>,
	) -> anyhow::Result<InsertOutcome> {
		Ok(InsertOutcome::Inserted)
	}

	async fn add_member(&self, _conversation: &ConversationId, _member: &Member) -> anyhow::Result<()> {
		Ok(())
	}

	async fn remove_member(&self, _conversation: &ConversationId, _user: &UserId) -> anyhow::Result<()> {
		Ok(())
	}

	async fn set_archived(&self, _conversation: &ConversationId, _user: &UserId, _archived: bool) -> anyhow::Result<()> {
		Ok(())
	}

	async fn set_last_read(&self, _conversation: &ConversationId, _user: &UserId, _seq: Seq) -> anyhow::Result<()> {
		Ok(())
	}

	async fn touch_activity(&self, _conversation: &ConversationId, _at_unix_ms: i64) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Keyset position in a conversation listing (`last_activity` desc, id asc).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
	pub last_activity_unix_ms: i64,
	pub id: ConversationId,
}

impl PageCursor {
	pub fn of(conversation: &Conversation) -> Self {
		Self {
			last_activity_unix_ms: conversation.last_activity_unix_ms,
			id: conversation.id.clone(),
		}
	}

	pub fn encode(&self) -> String {
		URL_SAFE_NO_PAD.encode(format!("{}|{}", self.last_activity_unix_ms, self.id))
	}

	pub fn decode(s: &str) -> Result<Self, RegistryError> {
		let raw = URL_SAFE_NO_PAD.decode(s.trim()).map_err(|_| RegistryError::InvalidCursor)?;
		let raw = String::from_utf8(raw).map_err(|_| RegistryError::InvalidCursor)?;
		let (ms, id) = raw.split_once('|').ok_or(RegistryError::InvalidCursor)?;
		Ok(Self {
			last_activity_unix_ms: ms.parse().map_err(|_| RegistryError::InvalidCursor)?,
			id: ConversationId::new(id).map_err(|_| RegistryError::InvalidCursor)?,
		})
	}

	/// True when `conversation` sorts strictly after this cursor.
	fn precedes(&self, conversation: &Conversation) -> bool {
		conversation.last_activity_unix_ms < self.last_activity_unix_ms
			|| (conversation.last_activity_unix_ms == self.last_activity_unix_ms && conversation.id > self.id)
	}
}

#[derive(Debug, Clone)]
pub struct ConversationPage {
	pub items: Vec<Conversation>,
	pub next_cursor: Option<PageCursor>,
}

/// Membership and metadata for all conversations.
pub struct ConversationRegistry {
	conversations: DashMap<ConversationId, Conversation>,
	direct_index: DashMap<DirectKey, ConversationId>,
	by_member: DashMap<UserId, HashSet<ConversationId>>,

	/// Serializes structural changes (creation, membership, archive).
	mutation_lock: Mutex<()>,
	backend: Arc<dyn RegistryBackend>,
}

impl ConversationRegistry {
	pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
		Self {
			conversations: DashMap::new(),
			direct_index: DashMap::new(),
			by_member: DashMap::new(),
			mutation_lock: Mutex::new(()),
			backend,
		}
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(VolatileRegistryBackend))
	}

	/// Build a registry pre-populated from `backend`.
	pub async fn hydrate(backend: Arc<dyn RegistryBackend>) -> anyhow::Result<Self> {
		let loaded = backend.load_all().await?;
		let registry = Self::new(backend);
		let count = loaded.len();
		for conversation in loaded {
			registry.index(conversation);
		}
		info!(conversations = count, "registry hydrated");
		Ok(registry)
	}

	fn index(&self, conversation: Conversation) {
		if let Some(key) = direct_key_of(&conversation) {
			self.direct_index.insert(key, conversation.id.clone());
		}
		for member in conversation.member_ids() {
			self.by_member
				.entry(member.clone())
				.or_default()
				.insert(conversation.id.clone());
		}
		self.conversations.insert(conversation.id.clone(), conversation);
	}

	pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
		self.conversations.get(id).map(|c| c.value().clone())
	}

	/// The conversation, provided `user` is currently a member.
	pub fn require_member(&self, id: &ConversationId, user: &UserId) -> Result<Conversation, RegistryError> {
		let conversation = self
			.conversations
			.get(id)
			.ok_or_else(|| RegistryError::UnknownConversation(id.clone()))?;
		if !conversation.is_member(user) {
			return Err(RegistryError::NotAMember {
				conversation: id.clone(),
				user: user.clone(),
			});
		}
		Ok(conversation.value().clone())
	}

	pub fn shares_conversation(&self, a: &UserId, b: &UserId) -> bool {
		if a == b {
			return true;
		}
		let Some(of_a) = self.by_member.get(a) else {
			return false;
		};
		let Some(of_b) = self.by_member.get(b) else {
			return false;
		};
		of_a.iter().any(|id| of_b.contains(id))
	}

	pub fn conversations_of(&self, user: &UserId) -> Vec<ConversationId> {
		self.by_member
			.get(user)
			.map(|ids| ids.iter().cloned().collect())
			.unwrap_or_default()
	}

	/// Idempotent: both orderings of the pair converge on one conversation.
	///
	/// Returns the conversation and whether this call created it.
	pub async fn create_direct(
		&self,
		a: &UserId,
		b: &UserId,
		now_unix_ms: i64,
	) -> Result<(Conversation, bool), RegistryError> {
		let key = DirectKey::new(a, b).map_err(|e| RegistryError::InvalidMembers(e.to_string()))?;

		if let Some(existing) = self.lookup_direct(&key) {
			return Ok((existing, false));
		}

		let _guard = self.mutation_lock.lock().await;
		if let Some(existing) = self.lookup_direct(&key) {
			return Ok((existing, false));
		}

		let (lo, hi) = key.users().map_err(|e| RegistryError::InvalidMembers(e.to_string()))?;
		let conversation = Conversation {
			id: ConversationId::new_v4(),
			kind: ConversationKind::Direct,
			title: None,
			members: [a, b]
				.into_iter()
				.map(|user| Member {
					user_id: user.clone(),
					joined_at_unix_ms: now_unix_ms,
					last_read_seq: 0,
					archived: false,
				})
				.collect(),
			created_at_unix_ms: now_unix_ms,
			last_activity_unix_ms: now_unix_ms,
		};

		match self
			.backend
			.insert_conversation(&conversation, Some(&key))
			.await
			.map_err(RegistryError::storage)?
		{
			InsertOutcome::Inserted => {
				debug!(conversation_id = %conversation.id, a = %lo, b = %hi, "registry: direct conversation created");
				self.index(conversation.clone());
				Ok((conversation, true))
			}
			InsertOutcome::Existing(id) => {
				let stored = self
					.backend
					.load_conversation(&id)
					.await
					.map_err(RegistryError::storage)?
					.ok_or_else(|| RegistryError::UnknownConversation(id.clone()))?;
				self.index(stored.clone());
				Ok((stored, false))
			}
		}
	}

	fn lookup_direct(&self, key: &DirectKey) -> Option<Conversation> {
		let id = self.direct_index.get(key)?.value().clone();
		self.get(&id)
	}

	/// Create a group from the creator plus `members` (deduplicated, creator first).
	pub async fn create_group(
		&self,
		creator: &UserId,
		members: impl IntoIterator<Item = UserId>,
		title: Option<String>,
		now_unix_ms: i64,
	) -> Result<Conversation, RegistryError> {
		let mut seen = HashSet::new();
		let member_ids: Vec<UserId> = std::iter::once(creator.clone())
			.chain(members)
			.filter(|m| seen.insert(m.clone()))
			.collect();

		if member_ids.len() < 2 {
			return Err(RegistryError::InvalidMembers(
				"a group needs at least two distinct members".into(),
			));
		}

		let conversation = Conversation {
			id: ConversationId::new_v4(),
			kind: ConversationKind::Group,
			title: title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
			members: member_ids
				.into_iter()
				.map(|user_id| Member {
					user_id,
					joined_at_unix_ms: now_unix_ms,
					last_read_seq: 0,
					archived: false,
				})
				.collect(),
			created_at_unix_ms: now_unix_ms,
			last_activity_unix_ms: now_unix_ms,
		};

		let _guard = self.mutation_lock.lock().await;
		self.backend
			.insert_conversation(&conversation, None)
			.await
			.map_err(RegistryError::storage)?;
		debug!(conversation_id = %conversation.id, members = conversation.members.len(), "registry: group created");
		self.index(conversation.clone());
		Ok(conversation)
	}

	pub async fn add_member(
		&self,
		id: &ConversationId,
		actor: &UserId,
		user: &UserId,
		now_unix_ms: i64,
	) -> Result<Conversation, RegistryError> {
		let _guard = self.mutation_lock.lock().await;
		let conversation = self.require_member(id, actor)?;
		if conversation.kind != ConversationKind::Group {
			return Err(RegistryError::NotAGroup);
		}
		if conversation.is_member(user) {
			return Ok(conversation);
		}

		let member = Member {
			user_id: user.clone(),
			joined_at_unix_ms: now_unix_ms,
			last_read_seq: 0,
			archived: false,
		};
		self.backend.add_member(id, &member).await.map_err(RegistryError::storage)?;

		self.by_member.entry(user.clone()).or_default().insert(id.clone());
		let mut entry = self
			.conversations
			.get_mut(id)
			.ok_or_else(|| RegistryError::UnknownConversation(id.clone()))?;
		entry.members.push(member);
		Ok(entry.value().clone())
	}

	/// Remove `target`. A member may always remove themselves; removing the
	/// last member leaves the group inert.
	pub async fn remove_member(
		&self,
		id: &ConversationId,
		actor: &UserId,
		target: &UserId,
	) -> Result<Conversation, RegistryError> {
		let _guard = self.mutation_lock.lock().await;
		let conversation = self.require_member(id, actor)?;
		if conversation.kind != ConversationKind::Group {
			return Err(RegistryError::NotAGroup);
		}
		if !conversation.is_member(target) {
			return Err(RegistryError::NotAMember {
				conversation: id.clone(),
				user: target.clone(),
			});
		}

		self.backend
			.remove_member(id, target)
			.await
			.map_err(RegistryError::storage)?;

		if let Some(mut ids) = self.by_member.get_mut(target) {
			ids.remove(id);
		}
		self.by_member.remove_if(target, |_, ids| ids.is_empty());

		let mut entry = self
			.conversations
			.get_mut(id)
			.ok_or_else(|| RegistryError::UnknownConversation(id.clone()))?;
		entry.members.retain(|m| &m.user_id != target);
		if entry.is_inert() {
			info!(conversation_id = %id, "registry: group has no members left");
		}
		Ok(entry.value().clone())
	}

	/// Archive or unarchive for `actor` alone; other members keep their listing.
	pub async fn set_archived(
		&self,
		id: &ConversationId,
		actor: &UserId,
		archived: bool,
	) -> Result<Conversation, RegistryError> {
		let _guard = self.mutation_lock.lock().await;
		self.require_member(id, actor)?;
		self.backend
			.set_archived(id, actor, archived)
			.await
			.map_err(RegistryError::storage)?;

		let mut entry = self
			.conversations
			.get_mut(id)
			.ok_or_else(|| RegistryError::UnknownConversation(id.clone()))?;
		let Some(member) = entry.members.iter_mut().find(|m| &m.user_id == actor) else {
			return Err(RegistryError::NotAMember {
				conversation: id.clone(),
				user: actor.clone(),
			});
		};
		member.archived = archived;
		Ok(entry.value().clone())
	}

	/// Advance `user`'s read cursor. Returns the effective cursor.
	pub async fn mark_read(&self, id: &ConversationId, user: &UserId, seq: Seq) -> Result<Seq, RegistryError> {
		let current = self
			.require_member(id, user)?
			.member(user)
			.map(|m| m.last_read_seq)
			.unwrap_or(0);
		if seq <= current {
			return Ok(current);
		}

		self.backend
			.set_last_read(id, user, seq)
			.await
			.map_err(RegistryError::storage)?;

		let mut entry = self
			.conversations
			.get_mut(id)
			.ok_or_else(|| RegistryError::UnknownConversation(id.clone()))?;
		let Some(member) = entry.members.iter_mut().find(|m| &m.user_id == user) else {
			return Err(RegistryError::NotAMember {
				conversation: id.clone(),
				user: user.clone(),
			});
		};
		member.last_read_seq = member.last_read_seq.max(seq);
		Ok(member.last_read_seq)
	}

	/// Bump `last_activity`; older timestamps are ignored.
	pub async fn touch_activity(&self, id: &ConversationId, at_unix_ms: i64) -> Result<(), RegistryError> {
		{
			let mut entry = self
				.conversations
				.get_mut(id)
				.ok_or_else(|| RegistryError::UnknownConversation(id.clone()))?;
			if at_unix_ms <= entry.last_activity_unix_ms {
				return Ok(());
			}
			entry.last_activity_unix_ms = at_unix_ms;
		}
		self.backend
			.touch_activity(id, at_unix_ms)
			.await
			.map_err(RegistryError::storage)
	}

	/// One page of the conversations `user` has not archived, newest activity first.
	pub fn page_for(&self, user: &UserId, after: Option<&PageCursor>, limit: usize) -> ConversationPage {
		let limit = limit.max(1);
		let mut visible: Vec<Conversation> = self
			.conversations_of(user)
			.into_iter()
			.filter_map(|id| self.get(&id))
			.filter(|c| c.is_member(user) && !c.is_archived_for(user))
			.filter(|c| after.is_none_or(|cursor| cursor.precedes(c)))
			.collect();

		visible.sort_by(|a, b| {
			(Reverse(a.last_activity_unix_ms), &a.id).cmp(&(Reverse(b.last_activity_unix_ms), &b.id))
		});

		let has_more = visible.len() > limit;
		visible.truncate(limit);
		let next_cursor = if has_more { visible.last().map(PageCursor::of) } else { None };

		ConversationPage {
			items: visible,
			next_cursor,
		}
	}

	pub fn pager<'a>(&'a self, user: &UserId, page_size: usize) -> ConversationPager<'a> {
		ConversationPager {
			registry: self,
			user: user.clone(),
			page_size,
			cursor: None,
			done: false,
		}
	}
}

/// Lazily walks a user's listing page by page.
pub struct ConversationPager<'a> {
	registry: &'a ConversationRegistry,
	user: UserId,
	page_size: usize,
	cursor: Option<PageCursor>,
	done: bool,
}

impl ConversationPager<'_> {
	/// Position after the last page handed out.
	pub fn cursor(&self) -> Option<&PageCursor> {
		self.cursor.as_ref()
	}
}

impl Iterator for ConversationPager<'_> {
	type Item = Vec<Conversation>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done {
			return None;
		}

		let page = self.registry.page_for(&self.user, self.cursor.as_ref(), self.page_size);
		match page.next_cursor {
			Some(cursor) => self.cursor = Some(cursor),
			None => self.done = true,
		}

		if page.items.is_empty() { None } else { Some(page.items) }
	}
}

/// Canonical key for a direct conversation (from its two members).
pub fn direct_key_of(conversation: &Conversation) -> Option<DirectKey> {
	if conversation.kind != ConversationKind::Direct {
		return None;
	}
	match conversation.members.as_slice() {
		[a, b] => DirectKey::new(&a.user_id, &b.user_id).ok(),
		_ => None,
	}
}
