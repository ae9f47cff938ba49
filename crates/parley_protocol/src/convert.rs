#![forbid(unsafe_code)]

//! Conversions between domain types and `parley.v1` messages.

use parley_domain::{ConversationId, IdempotencyToken, Message, ParseIdError, PresenceSnapshot, UserId};

use crate::pb;
use crate::version::PROTOCOL_VERSION_U32;

impl From<&Message> for pb::MessageRecord {
	fn from(m: &Message) -> Self {
		Self {
			conversation_id: m.conversation_id.to_string(),
			seq: m.seq,
			sender_id: m.sender_id.to_string(),
			content: if m.deleted { String::new() } else { m.content.clone() },
			created_at_unix_ms: m.created_at_unix_ms,
			idempotency_token: m.idempotency_token.to_string(),
			deleted: m.deleted,
			revises: m.revises,
		}
	}
}

impl TryFrom<pb::MessageRecord> for Message {
	type Error = ParseIdError;

	fn try_from(r: pb::MessageRecord) -> Result<Self, Self::Error> {
		if r.seq == 0 {
			return Err(ParseIdError::InvalidFormat("seq must be > 0".into()));
		}
		Ok(Message {
			conversation_id: ConversationId::new(r.conversation_id)?,
			seq: r.seq,
			sender_id: UserId::new(r.sender_id)?,
			content: r.content,
			created_at_unix_ms: r.created_at_unix_ms,
			idempotency_token: IdempotencyToken::new(r.idempotency_token),
			deleted: r.deleted,
			revises: r.revises,
		})
	}
}

/// Presence state for `user`.
pub fn presence_state(user: &UserId, snapshot: PresenceSnapshot) -> pb::PresenceState {
	pb::PresenceState {
		user_id: user.to_string(),
		online: snapshot.is_online(),
		last_seen_unix_ms: snapshot.last_seen_unix_ms,
	}
}

/// Wrap a message into an envelope stamped with the current protocol version.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION_U32,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}

pub fn error_envelope(request_id: impl Into<String>, code: pb::ErrorCode, message: impl Into<String>) -> pb::Envelope {
	error_envelope_with_detail(request_id, code, message, 0)
}

pub fn error_envelope_with_detail(
	request_id: impl Into<String>,
	code: pb::ErrorCode,
	message: impl Into<String>,
	detail: u64,
) -> pb::Envelope {
	envelope(
		request_id,
		pb::envelope::Msg::Error(pb::Error {
			code: code as i32,
			message: message.into(),
			detail,
		}),
	)
}

pub fn event_envelope(conversation_id: impl Into<String>, kind: pb::event::Kind) -> pb::Envelope {
	envelope(
		String::new(),
		pb::envelope::Msg::Event(pb::Event {
			conversation_id: conversation_id.into(),
			kind: Some(kind),
		}),
	)
}

pub fn request_envelope(request_id: impl Into<String>, kind: pb::request::Kind) -> pb::Envelope {
	envelope(request_id, pb::envelope::Msg::Request(pb::Request { kind: Some(kind) }))
}

pub fn response_envelope(request_id: impl Into<String>, kind: pb::response::Kind) -> pb::Envelope {
	envelope(request_id, pb::envelope::Msg::Response(pb::Response { kind: Some(kind) }))
}
