#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use parley_domain::{ConversationId, IdempotencyToken, Message, Seq, UserId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::auth::{AuthError, Identity, IdentityProvider};
use crate::server::fanout::FanoutEvent;
use crate::server::gateway::{
	CatchUpItem, Connected, ConnectionHandle, Gateway, GatewayConfig, GatewayError, SendRejection,
};
use crate::server::log::{AppendRequest, DeliveryLog, InMemoryLogBackend, LogBackend, LogConfig};
use crate::server::registry::ConversationRegistry;

/// Accepts any credential as the user id; `slow:` credentials never answer in time.
struct PlainIdentity;

#[async_trait]
impl IdentityProvider for PlainIdentity {
	async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
		if let Some(rest) = credential.strip_prefix("slow:") {
			tokio::time::sleep(Duration::from_secs(5)).await;
			return Err(AuthError::Invalid(rest.to_string()));
		}
		let user_id = UserId::new(credential).map_err(|e| AuthError::Invalid(e.to_string()))?;
		Ok(Identity {
			display_name: Some(credential.to_uppercase()),
			avatar_ref: None,
			user_id,
		})
	}
}

/// Delegates reads to memory but fails every append.
#[derive(Default)]
struct BrokenAppends {
	inner: InMemoryLogBackend,
}

#[async_trait]
impl LogBackend for BrokenAppends {
	async fn find_by_token(
		&self,
		conversation: &ConversationId,
		sender: &UserId,
		token: &IdempotencyToken,
		not_before_unix_ms: i64,
	) -> anyhow::Result<Option<Message>> {
		self.inner.find_by_token(conversation, sender, token, not_before_unix_ms).await
	}

	async fn append(&self, _request: &AppendRequest) -> anyhow::Result<Message> {
		anyhow::bail!("disk on fire")
	}

	async fn read_range(
		&self,
		conversation: &ConversationId,
		from: Seq,
		to: Seq,
		limit: usize,
	) -> anyhow::Result<Vec<Message>> {
		self.inner.read_range(conversation, from, to, limit).await
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

fn gateway_with(cfg: GatewayConfig, log: DeliveryLog) -> Gateway {
	Gateway::new(cfg, Arc::new(PlainIdentity), ConversationRegistry::in_memory(), log)
}

fn gateway() -> Gateway {
	gateway_with(GatewayConfig::default(), DeliveryLog::in_memory(LogConfig::default()))
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn token(t: &str) -> IdempotencyToken {
	IdempotencyToken::new(t)
}

async fn connect(gw: &Gateway, who: &str) -> Connected {
	gw.connect(who).await.expect("connect")
}

async fn next_event(rx: &mut mpsc::Receiver<FanoutEvent>) -> FanoutEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<FanoutEvent>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "unexpected event: {got:?}");
}

async fn direct(gw: &Gateway, a: &ConnectionHandle, b: &str) -> ConversationId {
	gw.create_direct(a, &user(b)).await.expect("create_direct").id
}

#[tokio::test]
async fn send_is_delivered_to_subscribed_members() {
	let gw = gateway();
	let alice = connect(&gw, "alice").await;
	let mut bob = connect(&gw, "bob").await;
	let conv = direct(&gw, &alice.handle, "bob").await;

	gw.subscribe(&bob.handle, &conv).await.unwrap();
	let accepted = gw.send(&alice.handle, &conv, "hi", token("t1")).await.unwrap();
	assert_eq!(accepted.message.seq, 1);
	assert!(!accepted.duplicate);

	match next_event(&mut bob.events).await {
		FanoutEvent::Message(m) => {
			assert_eq!(m.seq, 1);
			assert_eq!(m.content, "hi");
			assert_eq!(m.sender_id, user("alice"));
		}
		other => panic!("unexpected event: {other:?}"),
	}
}

#[tokio::test]
async fn duplicate_send_returns_original_without_redelivery() {
	let gw = gateway();
	let alice = connect(&gw, "alice").await;
	let mut bob = connect(&gw, "bob").await;
	let conv = direct(&gw, &alice.handle, "bob").await;
	gw.subscribe(&bob.handle, &conv).await.unwrap();

	let first = gw.send(&alice.handle, &conv, "hi", token("t1")).await.unwrap();
	let second = gw.send(&alice.handle, &conv, "hi", token("t1")).await.unwrap();
	assert_eq!(first.message.seq, second.message.seq);
	assert!(second.duplicate);

	next_event(&mut bob.events).await;
	assert_quiet(&mut bob.events).await;
	assert_eq!(gw.log().head(&conv).await.unwrap(), 1);

	let err = gw.send(&alice.handle, &conv, "different", token("t1")).await.unwrap_err();
	assert_eq!(err, SendRejection::Conflict { seq: 1 });
}

#[tokio::test]
async fn send_rejections() {
	let gw = gateway_with(
		GatewayConfig {
			max_content_code_points: 8,
			..GatewayConfig::default()
		},
		DeliveryLog::in_memory(LogConfig::default()),
	);
	let alice = connect(&gw, "alice").await;
	let carol = connect(&gw, "carol").await;
	let conv = direct(&gw, &alice.handle, "bob").await;

	assert_eq!(
		gw.send(&carol.handle, &conv, "hi", token("")).await.unwrap_err(),
		SendRejection::NotAMember
	);
	let unknown = ConversationId::new("nope").unwrap();
	assert_eq!(
		gw.send(&alice.handle, &unknown, "hi", token("")).await.unwrap_err(),
		SendRejection::UnknownConversation
	);
	assert_eq!(
		gw.send(&alice.handle, &conv, " \n\t", token("")).await.unwrap_err(),
		SendRejection::EmptyContent
	);

	// Exactly at the limit is fine; code points, not bytes.
	gw.send(&alice.handle, &conv, "ééééé😀😀😀", token("")).await.unwrap();
	assert_eq!(
		gw.send(&alice.handle, &conv, "ééééé😀😀😀!", token("")).await.unwrap_err(),
		SendRejection::PayloadTooLarge { len: 9, max: 8 }
	);
}

#[tokio::test]
async fn storage_failure_rejects_without_delivery() {
	let gw = gateway_with(
		GatewayConfig::default(),
		DeliveryLog::new(Arc::new(BrokenAppends::default()), LogConfig::default()),
	);
	let alice = connect(&gw, "alice").await;
	let mut bob = connect(&gw, "bob").await;
	let conv = direct(&gw, &alice.handle, "bob").await;
	gw.subscribe(&bob.handle, &conv).await.unwrap();

	let err = gw.send(&alice.handle, &conv, "hi", token("t1")).await.unwrap_err();
	assert!(matches!(err, SendRejection::StorageUnavailable(_)), "got {err:?}");
	assert_quiet(&mut bob.events).await;
}

#[tokio::test]
async fn auth_timeout_fails_closed() {
	let gw = gateway_with(
		GatewayConfig {
			auth_timeout: Duration::from_millis(20),
			..GatewayConfig::default()
		},
		DeliveryLog::in_memory(LogConfig::default()),
	);
	let err = gw.connect("slow:alice").await.err().expect("connect must fail");
	assert_eq!(err, AuthError::Timeout);
	assert!(!gw.presence().status(&user("alice")).is_online());
}

#[tokio::test]
async fn catch_up_after_reconnect_is_complete() {
	let gw = gateway();
	let alice = connect(&gw, "alice").await;
	let bob = connect(&gw, "bob").await;
	let conv = direct(&gw, &alice.handle, "bob").await;

	gw.send(&alice.handle, &conv, "one", token("t1")).await.unwrap();
	gw.disconnect(&bob.handle);

	for (i, text) in ["two", "three", "four"].iter().enumerate() {
		gw.send(&alice.handle, &conv, text, token(&format!("t{}", i + 2))).await.unwrap();
	}

	let bob = connect(&gw, "bob").await;
	let info = gw.subscribe(&bob.handle, &conv).await.unwrap();
	assert_eq!(info.head_seq, 4);

	let feed = gw.catch_up(&bob.handle, &conv, 1).await.unwrap();
	let items: Vec<CatchUpItem> = feed.items.try_collect().await.unwrap();
	let seqs: Vec<Seq> = items
		.iter()
		.filter_map(|i| match i {
			CatchUpItem::Message(m) => Some(m.seq),
			CatchUpItem::CaughtUp { .. } => None,
		})
		.collect();
	assert_eq!(seqs, vec![2, 3, 4]);
	assert_eq!(items.last(), Some(&CatchUpItem::CaughtUp { head_seq: 4 }));
}

#[tokio::test]
async fn presence_is_pushed_only_to_watchers_sharing_a_conversation() {
	let gw = gateway();
	let mut bob = connect(&gw, "bob").await;
	let mut carol = connect(&gw, "carol").await;
	direct(&gw, &bob.handle, "alice").await;

	let snapshot = gw.watch_presence(&bob.handle, &user("alice")).unwrap();
	assert!(!snapshot.is_online());
	assert!(matches!(
		gw.watch_presence(&carol.handle, &user("alice")),
		Err(GatewayError::Forbidden(_))
	));

	let alice = connect(&gw, "alice").await;
	match next_event(&mut bob.events).await {
		FanoutEvent::Presence { user_id, snapshot } => {
			assert_eq!(user_id, user("alice"));
			assert!(snapshot.is_online());
		}
		other => panic!("unexpected event: {other:?}"),
	}
	assert_quiet(&mut carol.events).await;

	gw.disconnect(&alice.handle);
	match next_event(&mut bob.events).await {
		FanoutEvent::Presence { snapshot, .. } => {
			assert!(!snapshot.is_online());
			assert!(snapshot.last_seen_unix_ms.is_some());
		}
		other => panic!("unexpected event: {other:?}"),
	}
}

#[tokio::test]
async fn edits_and_deletes_belong_to_the_sender() {
	let gw = gateway();
	let alice = connect(&gw, "alice").await;
	let mut bob = connect(&gw, "bob").await;
	let conv = direct(&gw, &alice.handle, "bob").await;
	gw.subscribe(&bob.handle, &conv).await.unwrap();

	gw.send(&alice.handle, &conv, "helo", token("t1")).await.unwrap();
	next_event(&mut bob.events).await;

	assert!(matches!(
		gw.edit(&bob.handle, &conv, 1, "hijack", token("e1")).await,
		Err(GatewayError::Forbidden(_))
	));
	let edited = gw.edit(&alice.handle, &conv, 1, "hello", token("e1")).await.unwrap();
	assert_eq!(edited.message.seq, 2);
	assert_eq!(edited.message.revises, Some(1));
	next_event(&mut bob.events).await;

	assert!(matches!(
		gw.delete_message(&bob.handle, &conv, 1).await,
		Err(GatewayError::Forbidden(_))
	));
	let deleted = gw.delete_message(&alice.handle, &conv, 1).await.unwrap();
	assert!(deleted.deleted);
	match next_event(&mut bob.events).await {
		FanoutEvent::MessageDeleted { seq, .. } => assert_eq!(seq, 1),
		other => panic!("unexpected event: {other:?}"),
	}

	let hits = gw.search(&alice.handle, &conv, "HEL", 0).await.unwrap();
	assert_eq!(hits.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2]);
	assert!(matches!(
		gw.edit(&alice.handle, &conv, 9, "x", token("")).await,
		Err(GatewayError::UnknownMessage { seq: 9 })
	));
}

#[tokio::test]
async fn listing_reports_members_last_message_and_unread() {
	let gw = gateway();
	let alice = connect(&gw, "alice").await;
	let bob = connect(&gw, "bob").await;
	let with_bob = direct(&gw, &alice.handle, "bob").await;
	let group = gw
		.create_group(&alice.handle, vec![user("bob"), user("carol")], Some("Weekend plans".into()))
		.await
		.unwrap()
		.id;

	gw.send(&bob.handle, &with_bob, "first", token("b1")).await.unwrap();
	gw.send(&bob.handle, &with_bob, "lunch?", token("b2")).await.unwrap();
	gw.send(&alice.handle, &group, "sat or sun", token("a1")).await.unwrap();

	let listing = gw.list_conversations(&alice.handle, None, 10, None).await.unwrap();
	assert_eq!(listing.items.len(), 2);
	assert!(listing.next_cursor.is_none());

	let dm = listing.items.iter().find(|v| v.conversation.id == with_bob).unwrap();
	assert_eq!(dm.unread_count, 2);
	let summary = dm.to_summary();
	assert_eq!(summary.last_message.as_ref().unwrap().content, "lunch?");
	let bob_entry = summary.members.iter().find(|m| m.id == "bob").unwrap();
	assert!(bob_entry.online);
	assert_eq!(bob_entry.display_name, "BOB");

	let own = listing.items.iter().find(|v| v.conversation.id == group).unwrap();
	assert_eq!(own.unread_count, 0, "own messages count as read");

	assert_eq!(gw.mark_read(&alice.handle, &with_bob, 99).await.unwrap(), 2);

	let filtered = gw.list_conversations(&alice.handle, None, 10, Some("WEEKEND")).await.unwrap();
	assert_eq!(filtered.items.len(), 1);
	assert_eq!(filtered.items[0].conversation.id, group);

	let by_member = gw.list_conversations(&alice.handle, None, 10, Some("caro")).await.unwrap();
	assert_eq!(by_member.items.len(), 1);

	let paged = gw.list_conversations(&alice.handle, None, 1, None).await.unwrap();
	assert_eq!(paged.items.len(), 1);
	let rest = gw
		.list_conversations(&alice.handle, paged.next_cursor.as_deref(), 1, None)
		.await
		.unwrap();
	assert_eq!(rest.items.len(), 1);
	assert_ne!(rest.items[0].conversation.id, paged.items[0].conversation.id);
}

#[tokio::test]
async fn removed_member_stops_receiving() {
	let gw = gateway();
	let alice = connect(&gw, "alice").await;
	let mut bob = connect(&gw, "bob").await;
	let group = gw
		.create_group(&alice.handle, vec![user("bob"), user("carol")], None)
		.await
		.unwrap()
		.id;
	gw.subscribe(&bob.handle, &group).await.unwrap();

	gw.remove_member(&alice.handle, &group, &user("bob")).await.unwrap();
	gw.send(&alice.handle, &group, "secret", token("")).await.unwrap();
	assert_quiet(&mut bob.events).await;
	assert_eq!(
		gw.send(&bob.handle, &group, "hey", token("")).await.unwrap_err(),
		SendRejection::NotAMember
	);
}

#[tokio::test]
async fn idle_connections_are_reaped() {
	let gw = gateway();
	let mut alice = connect(&gw, "alice").await;
	assert!(gw.heartbeat(&alice.handle));

	let reaped = gw.reap_idle(Instant::now() + Duration::from_secs(61));
	assert_eq!(reaped, 1);
	assert!(!gw.presence().status(&user("alice")).is_online());
	assert!(!gw.heartbeat(&alice.handle));
	assert!(alice.events.recv().await.is_none(), "queue closes after eviction");
	assert!(timeout(Duration::from_millis(250), &mut alice.closed).await.is_ok());

	// The session's own teardown afterwards is harmless.
	gw.disconnect(&alice.handle);
}

#[tokio::test]
async fn slow_subscriber_is_evicted_offline_and_signalled() {
	let gw = gateway_with(
		GatewayConfig {
			outbound_queue_capacity: 1,
			..GatewayConfig::default()
		},
		DeliveryLog::in_memory(LogConfig::default()),
	);
	let mut alice = connect(&gw, "alice").await;
	let mut bob = connect(&gw, "bob").await;
	let conv = direct(&gw, &alice.handle, "bob").await;
	gw.subscribe(&bob.handle, &conv).await.unwrap();
	gw.watch_presence(&alice.handle, &user("bob")).unwrap();

	// Bob never drains; the second message overflows his queue.
	gw.send(&alice.handle, &conv, "one", token("")).await.unwrap();
	gw.send(&alice.handle, &conv, "two", token("")).await.unwrap();

	assert!(!gw.presence().status(&user("bob")).is_online());
	assert!(!gw.heartbeat(&bob.handle));
	timeout(Duration::from_millis(250), &mut bob.closed)
		.await
		.expect("drop signal without draining the queue")
		.expect_err("signal is the sender going away");
	assert_eq!(
		gw.send(&bob.handle, &conv, "late", token("")).await.unwrap_err(),
		SendRejection::UnknownConnection
	);

	match next_event(&mut alice.events).await {
		FanoutEvent::Presence { user_id, snapshot } => {
			assert_eq!(user_id, user("bob"));
			assert!(!snapshot.is_online());
			assert!(snapshot.last_seen_unix_ms.is_some());
		}
		other => panic!("unexpected event: {other:?}"),
	}
}

#[tokio::test]
async fn purge_history_drops_messages_and_search_hits() {
	let gw = gateway();
	let alice = connect(&gw, "alice").await;
	let conv = direct(&gw, &alice.handle, "bob").await;
	for i in 0..3 {
		gw.send(&alice.handle, &conv, &format!("note {i}"), token("")).await.unwrap();
	}
	assert_eq!(gw.search(&alice.handle, &conv, "note", 0).await.unwrap().len(), 3);

	assert_eq!(gw.purge_history(&alice.handle, &conv, 2).await.unwrap(), 2);
	let hits = gw.search(&alice.handle, &conv, "note", 0).await.unwrap();
	assert_eq!(hits.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3]);

	let feed = gw.catch_up(&alice.handle, &conv, 0).await.unwrap();
	assert_eq!(feed.oldest_available, 3);
}
