#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod content;
pub mod model;

pub use content::{ContentError, DEFAULT_MAX_CONTENT_CODE_POINTS, validate_content};
pub use model::{
	Conversation, ConversationSummary, LastMessage, Member, MemberSummary, Message, MessageRecord, PresenceSnapshot,
	PresenceStatus, UserProfile, format_unix_ms_rfc3339,
};

/// Per-conversation sequence number assigned by the delivery log.
///
/// `0` is never assigned; it is used as the "nothing seen yet" cursor.
pub type Seq = u64;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown conversation kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Conversation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
	Direct,
	Group,
}

impl ConversationKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ConversationKind::Direct => "direct",
			ConversationKind::Group => "group",
		}
	}
}

impl fmt::Display for ConversationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ConversationKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"direct" | "dm" => Ok(ConversationKind::Direct),
			"group" => Ok(ConversationKind::Group),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Opaque user identifier issued by the external identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.contains('|') {
			return Err(ParseIdError::InvalidFormat("user id must not contain '|'".into()));
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Conversation identifier (server-generated).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
	/// Create a new random conversation id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	/// Wrap an existing non-empty id.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConversationId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConversationId::new(s.to_string())
	}
}

/// Server-local connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Client-generated token used to deduplicate retried sends.
///
/// An empty token disables deduplication for that send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
	pub fn new(token: impl Into<String>) -> Self {
		Self(token.into().trim().to_string())
	}
	pub fn none() -> Self {
		Self(String::new())
	}
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for IdempotencyToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Order-independent key for a pair of users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectKey(String);

impl DirectKey {
	/// Build the canonical key for `{a, b}`. Fails for `a == b`.
	pub fn new(a: &UserId, b: &UserId) -> Result<Self, ParseIdError> {
		if a == b {
			return Err(ParseIdError::InvalidFormat(
				"direct conversation needs two distinct users".into(),
			));
		}
		let (lo, hi) = if a < b { (a, b) } else { (b, a) };
		Ok(Self(format!("{}|{}", lo.as_str(), hi.as_str())))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Split back into the sorted pair.
	pub fn users(&self) -> Result<(UserId, UserId), ParseIdError> {
		let (lo, hi) = self
			.0
			.split_once('|')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected user|user".into()))?;
		Ok((UserId::new(lo)?, UserId::new(hi)?))
	}
}

impl fmt::Display for DirectKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
