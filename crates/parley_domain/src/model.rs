#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConversationId, ConversationKind, IdempotencyToken, Seq, UserId};

/// Render unix milliseconds as an RFC 3339 timestamp (UTC, millisecond precision).
pub fn format_unix_ms_rfc3339(unix_ms: i64) -> String {
	DateTime::<Utc>::from_timestamp_millis(unix_ms)
		.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
		.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A message as stored in the delivery log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub conversation_id: ConversationId,
	pub seq: Seq,
	pub sender_id: UserId,
	pub content: String,
	pub created_at_unix_ms: i64,
	pub idempotency_token: IdempotencyToken,
	pub deleted: bool,
	/// Set when this message is an edit revision of an earlier message.
	pub revises: Option<Seq>,
}

impl Message {
	/// Stable record id: `<conversation_id>:<seq>`.
	pub fn record_id(&self) -> String {
		format!("{}:{}", self.conversation_id, self.seq)
	}
}

/// Message record shape consumed by JSON clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
	pub id: String,
	pub conversation_id: String,
	pub sender_id: String,
	pub content: String,
	pub seq: Seq,
	pub created_at: String,
	pub idempotency_token: String,
	#[serde(default)]
	pub deleted: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub revises: Option<Seq>,
}

impl From<&Message> for MessageRecord {
	fn from(m: &Message) -> Self {
		Self {
			id: m.record_id(),
			conversation_id: m.conversation_id.to_string(),
			sender_id: m.sender_id.to_string(),
			content: if m.deleted { String::new() } else { m.content.clone() },
			seq: m.seq,
			created_at: format_unix_ms_rfc3339(m.created_at_unix_ms),
			idempotency_token: m.idempotency_token.to_string(),
			deleted: m.deleted,
			revises: m.revises,
		}
	}
}

/// Conversation membership entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
	pub user_id: UserId,
	pub joined_at_unix_ms: i64,
	/// Durable read cursor; everything with `seq <= last_read_seq` is read.
	pub last_read_seq: Seq,
	/// Hidden from this member's listing only.
	#[serde(default)]
	pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
	pub id: ConversationId,
	pub kind: ConversationKind,
	pub title: Option<String>,
	/// Ordered by join time.
	pub members: Vec<Member>,
	pub created_at_unix_ms: i64,
	pub last_activity_unix_ms: i64,
}

impl Conversation {
	pub fn is_member(&self, user: &UserId) -> bool {
		self.members.iter().any(|m| &m.user_id == user)
	}

	pub fn member(&self, user: &UserId) -> Option<&Member> {
		self.members.iter().find(|m| &m.user_id == user)
	}

	/// `false` for non-members.
	pub fn is_archived_for(&self, user: &UserId) -> bool {
		self.member(user).is_some_and(|m| m.archived)
	}

	pub fn member_ids(&self) -> impl Iterator<Item = &UserId> {
		self.members.iter().map(|m| &m.user_id)
	}

	/// A group with no members left accepts no further activity.
	pub fn is_inert(&self) -> bool {
		self.members.is_empty()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
	Online,
	Offline,
}

/// Point-in-time view of a user's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
	pub status: PresenceStatus,
	/// Close time of the last connection; `None` if never seen offline.
	pub last_seen_unix_ms: Option<i64>,
}

impl PresenceSnapshot {
	pub const fn unknown() -> Self {
		Self {
			status: PresenceStatus::Offline,
			last_seen_unix_ms: None,
		}
	}

	pub fn is_online(&self) -> bool {
		self.status == PresenceStatus::Online
	}
}

/// Profile data owned by the external profile store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
	pub id: UserId,
	pub display_name: String,
	pub avatar_ref: String,
}

impl UserProfile {
	/// Fallback profile when the store has nothing for this id.
	pub fn placeholder(id: UserId) -> Self {
		Self {
			display_name: id.to_string(),
			id,
			avatar_ref: String::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSummary {
	pub id: String,
	pub display_name: String,
	pub avatar_ref: String,
	pub online: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_seen: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
	pub content: String,
	pub created_at: String,
}

/// Listing shape consumed by the chat list UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
	pub id: String,
	pub kind: ConversationKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	pub members: Vec<MemberSummary>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_message: Option<LastMessage>,
	pub unread_count: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn msg(deleted: bool) -> Message {
		Message {
			conversation_id: ConversationId::new("c1").unwrap(),
			seq: 1,
			sender_id: UserId::new("alice").unwrap(),
			content: "hi".to_string(),
			created_at_unix_ms: 1_700_000_000_123,
			idempotency_token: IdempotencyToken::new("t1"),
			deleted,
			revises: None,
		}
	}

	#[test]
	fn record_uses_camel_case_and_rfc3339() {
		let rec = MessageRecord::from(&msg(false));
		let json = serde_json::to_value(&rec).unwrap();
		assert_eq!(json["conversationId"], "c1");
		assert_eq!(json["senderId"], "alice");
		assert_eq!(json["idempotencyToken"], "t1");
		assert_eq!(json["createdAt"], "2023-11-14T22:13:20.123Z");
		assert_eq!(json["id"], "c1:1");
		assert!(json.get("revises").is_none());
	}

	#[test]
	fn deleted_record_hides_content() {
		let rec = MessageRecord::from(&msg(true));
		assert!(rec.deleted);
		assert!(rec.content.is_empty());
	}

	#[test]
	fn inert_conversation_has_no_members() {
		let conv = Conversation {
			id: ConversationId::new("g").unwrap(),
			kind: ConversationKind::Group,
			title: None,
			members: Vec::new(),
			created_at_unix_ms: 0,
			last_activity_unix_ms: 0,
		};
		assert!(conv.is_inert());
		assert!(!conv.is_member(&UserId::new("alice").unwrap()));
	}
}
