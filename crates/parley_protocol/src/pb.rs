//! `parley.v1` wire messages.
//!
//! Every frame on a stream carries exactly one [`Envelope`]. The control stream
//! carries the handshake, requests and their responses (correlated by
//! `request_id`); the events stream carries only [`Event`] envelopes.

#![forbid(unsafe_code)]
#![allow(clippy::large_enum_variant)]

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Client-chosen id echoed back on the matching response or error.
	#[prost(string, tag = "2")]
	pub request_id: ::prost::alloc::string::String,
	#[prost(oneof = "envelope::Msg", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
	pub msg: ::core::option::Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Error(super::Error),
		#[prost(message, tag = "13")]
		Ping(super::Ping),
		#[prost(message, tag = "14")]
		Pong(super::Pong),
		#[prost(message, tag = "15")]
		Request(super::Request),
		#[prost(message, tag = "16")]
		Response(super::Response),
		#[prost(message, tag = "17")]
		Event(super::Event),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub credential: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub client_name: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub client_instance_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub user_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "3")]
	pub connection_id: u64,
	#[prost(int64, tag = "4")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "5")]
	pub max_frame_size: u32,
	#[prost(uint32, tag = "6")]
	pub max_content_code_points: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
	Unspecified = 0,
	Unauthorized = 1,
	NotAMember = 2,
	PayloadTooLarge = 3,
	EmptyContent = 4,
	UnknownConversation = 5,
	Conflict = 6,
	StorageUnavailable = 7,
	InvalidRequest = 8,
	Forbidden = 9,
}

impl ErrorCode {
	/// Stable upper-case name used in logs and by the CLI.
	pub const fn as_str_name(&self) -> &'static str {
		match self {
			ErrorCode::Unspecified => "UNSPECIFIED",
			ErrorCode::Unauthorized => "UNAUTHORIZED",
			ErrorCode::NotAMember => "NOT_A_MEMBER",
			ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
			ErrorCode::EmptyContent => "EMPTY_CONTENT",
			ErrorCode::UnknownConversation => "UNKNOWN_CONVERSATION",
			ErrorCode::Conflict => "CONFLICT",
			ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
			ErrorCode::InvalidRequest => "INVALID_REQUEST",
			ErrorCode::Forbidden => "FORBIDDEN",
		}
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(enumeration = "ErrorCode", tag = "1")]
	pub code: i32,
	#[prost(string, tag = "2")]
	pub message: ::prost::alloc::string::String,
	/// Existing seq for `CONFLICT`; limit for `PAYLOAD_TOO_LARGE`.
	#[prost(uint64, tag = "3")]
	pub detail: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub server_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
	#[prost(oneof = "request::Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13")]
	pub kind: ::core::option::Option<request::Kind>,
}

pub mod request {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Kind {
		#[prost(message, tag = "1")]
		Subscribe(super::Subscribe),
		#[prost(message, tag = "2")]
		Unsubscribe(super::Unsubscribe),
		#[prost(message, tag = "3")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "4")]
		EditMessage(super::EditMessage),
		#[prost(message, tag = "5")]
		DeleteMessage(super::DeleteMessage),
		#[prost(message, tag = "6")]
		CreateDirect(super::CreateDirect),
		#[prost(message, tag = "7")]
		CreateGroup(super::CreateGroup),
		#[prost(message, tag = "8")]
		UpdateMembers(super::UpdateMembers),
		#[prost(message, tag = "9")]
		Archive(super::Archive),
		#[prost(message, tag = "10")]
		ListConversations(super::ListConversations),
		#[prost(message, tag = "11")]
		Search(super::Search),
		#[prost(message, tag = "12")]
		MarkRead(super::MarkRead),
		#[prost(message, tag = "13")]
		WatchPresence(super::WatchPresence),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscription {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	/// Highest seq the client already has; `0` replays from the start.
	#[prost(uint64, tag = "2")]
	pub after_seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscribe {
	#[prost(message, repeated, tag = "1")]
	pub subs: ::prost::alloc::vec::Vec<Subscription>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Unsubscribe {
	#[prost(string, repeated, tag = "1")]
	pub conversation_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub content: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub idempotency_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EditMessage {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub target_seq: u64,
	#[prost(string, tag = "3")]
	pub content: ::prost::alloc::string::String,
	#[prost(string, tag = "4")]
	pub idempotency_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMessage {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateDirect {
	#[prost(string, tag = "1")]
	pub peer_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateGroup {
	#[prost(string, repeated, tag = "1")]
	pub member_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
	#[prost(string, optional, tag = "2")]
	pub title: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateMembers {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(string, repeated, tag = "2")]
	pub add: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
	#[prost(string, repeated, tag = "3")]
	pub remove: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Archive {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	/// `false` unarchives.
	#[prost(bool, tag = "2")]
	pub archived: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListConversations {
	/// Opaque cursor from a previous page; empty for the first page.
	#[prost(string, tag = "1")]
	pub cursor: ::prost::alloc::string::String,
	#[prost(uint32, tag = "2")]
	pub limit: u32,
	#[prost(string, tag = "3")]
	pub filter: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Search {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub query: ::prost::alloc::string::String,
	/// `0` means no limit.
	#[prost(uint32, tag = "3")]
	pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkRead {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchPresence {
	#[prost(string, tag = "1")]
	pub user_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
	#[prost(oneof = "response::Kind", tags = "1, 2, 3, 4, 5, 6, 7")]
	pub kind: ::core::option::Option<response::Kind>,
}

pub mod response {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Kind {
		#[prost(message, tag = "1")]
		Subscribed(super::SubscribeResult),
		#[prost(message, tag = "2")]
		Sent(super::SendResult),
		#[prost(message, tag = "3")]
		Conversation(super::ConversationInfo),
		#[prost(message, tag = "4")]
		Conversations(super::ConversationPage),
		#[prost(message, tag = "5")]
		SearchResults(super::SearchResults),
		#[prost(message, tag = "6")]
		Ack(super::Ack),
		#[prost(message, tag = "7")]
		Presence(super::PresenceState),
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SubscriptionStatus {
	Unspecified = 0,
	Ok = 1,
	NotAMember = 2,
	UnknownConversation = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionResult {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(enumeration = "SubscriptionStatus", tag = "2")]
	pub status: i32,
	#[prost(uint64, tag = "3")]
	pub head_seq: u64,
	/// Oldest seq still readable; a larger value than `after_seq + 1` means a gap.
	#[prost(uint64, tag = "4")]
	pub oldest_available_seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeResult {
	#[prost(message, repeated, tag = "1")]
	pub results: ::prost::alloc::vec::Vec<SubscriptionResult>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SendStatus {
	Unspecified = 0,
	Accepted = 1,
	Duplicate = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendResult {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub seq: u64,
	#[prost(enumeration = "SendStatus", tag = "3")]
	pub status: i32,
	#[prost(int64, tag = "4")]
	pub created_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberInfo {
	#[prost(string, tag = "1")]
	pub user_id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub display_name: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub avatar_ref: ::prost::alloc::string::String,
	#[prost(bool, tag = "4")]
	pub online: bool,
	#[prost(int64, optional, tag = "5")]
	pub last_seen_unix_ms: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationInfo {
	#[prost(string, tag = "1")]
	pub id: ::prost::alloc::string::String,
	/// `direct` or `group`.
	#[prost(string, tag = "2")]
	pub kind: ::prost::alloc::string::String,
	#[prost(string, optional, tag = "3")]
	pub title: ::core::option::Option<::prost::alloc::string::String>,
	#[prost(message, repeated, tag = "4")]
	pub members: ::prost::alloc::vec::Vec<MemberInfo>,
	#[prost(bool, tag = "5")]
	pub archived: bool,
	#[prost(int64, tag = "6")]
	pub created_at_unix_ms: i64,
	#[prost(int64, tag = "7")]
	pub last_activity_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LastMessage {
	#[prost(string, tag = "1")]
	pub content: ::prost::alloc::string::String,
	#[prost(int64, tag = "2")]
	pub created_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationSummary {
	#[prost(message, optional, tag = "1")]
	pub info: ::core::option::Option<ConversationInfo>,
	#[prost(message, optional, tag = "2")]
	pub last_message: ::core::option::Option<LastMessage>,
	#[prost(uint64, tag = "3")]
	pub unread_count: u64,
	#[prost(uint64, tag = "4")]
	pub head_seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConversationPage {
	#[prost(message, repeated, tag = "1")]
	pub items: ::prost::alloc::vec::Vec<ConversationSummary>,
	/// Empty when there are no further pages.
	#[prost(string, tag = "2")]
	pub next_cursor: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageRecord {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(uint64, tag = "2")]
	pub seq: u64,
	#[prost(string, tag = "3")]
	pub sender_id: ::prost::alloc::string::String,
	#[prost(string, tag = "4")]
	pub content: ::prost::alloc::string::String,
	#[prost(int64, tag = "5")]
	pub created_at_unix_ms: i64,
	#[prost(string, tag = "6")]
	pub idempotency_token: ::prost::alloc::string::String,
	#[prost(bool, tag = "7")]
	pub deleted: bool,
	#[prost(uint64, optional, tag = "8")]
	pub revises: ::core::option::Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SearchResults {
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(message, repeated, tag = "2")]
	pub messages: ::prost::alloc::vec::Vec<MessageRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PresenceState {
	#[prost(string, tag = "1")]
	pub user_id: ::prost::alloc::string::String,
	#[prost(bool, tag = "2")]
	pub online: bool,
	#[prost(int64, optional, tag = "3")]
	pub last_seen_unix_ms: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CaughtUp {
	#[prost(uint64, tag = "1")]
	pub head_seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageDeleted {
	#[prost(uint64, tag = "1")]
	pub seq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
	/// Empty for presence events.
	#[prost(string, tag = "1")]
	pub conversation_id: ::prost::alloc::string::String,
	#[prost(oneof = "event::Kind", tags = "10, 11, 12, 13")]
	pub kind: ::core::option::Option<event::Kind>,
}

pub mod event {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Kind {
		#[prost(message, tag = "10")]
		Message(super::MessageRecord),
		#[prost(message, tag = "11")]
		CaughtUp(super::CaughtUp),
		#[prost(message, tag = "12")]
		Presence(super::PresenceState),
		#[prost(message, tag = "13")]
		MessageDeleted(super::MessageDeleted),
	}
}
