#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ConnectionId, ConversationId, IdempotencyToken, Message, PresenceSnapshot, Seq, UserId};
use tokio::time::timeout;

use crate::server::fanout::{FanoutConfig, FanoutEvent, FanoutRouter};

fn conv(id: &str) -> ConversationId {
	ConversationId::new(id).expect("valid ConversationId")
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn message(conversation: &str, seq: Seq) -> FanoutEvent {
	FanoutEvent::Message(Arc::new(Message {
		conversation_id: conv(conversation),
		seq,
		sender_id: user("alice"),
		content: format!("m{seq}"),
		created_at_unix_ms: 0,
		idempotency_token: IdempotencyToken::none(),
		deleted: false,
		revises: None,
	}))
}

fn router(capacity: usize) -> FanoutRouter {
	FanoutRouter::new(FanoutConfig {
		outbound_queue_capacity: capacity,
		debug_logs: false,
	})
}

#[tokio::test]
async fn publish_reaches_only_subscribers_of_that_conversation() {
	let router = router(16);
	let mut rx_a = router.register(&user("a"), ConnectionId(1));
	let mut rx_b = router.register(&user("b"), ConnectionId(2));
	assert!(router.subscribe(ConnectionId(1), &conv("c1")));
	assert!(router.subscribe(ConnectionId(2), &conv("c2")));

	let report = router.publish(&conv("c1"), message("c1", 1));
	assert_eq!(report.delivered, 1);

	let got_unexpected = timeout(Duration::from_millis(50), rx_b.recv()).await;
	assert!(got_unexpected.is_err(), "subscriber of c2 received a c1 event");

	let item = timeout(Duration::from_millis(250), rx_a.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	match item {
		FanoutEvent::Message(m) => assert_eq!(m.seq, 1),
		other => panic!("unexpected item: {other:?}"),
	}
}

#[tokio::test]
async fn per_subscriber_order_follows_publish_order() {
	let router = router(64);
	let mut rx = router.register(&user("a"), ConnectionId(1));
	router.subscribe(ConnectionId(1), &conv("c1"));

	for seq in 1..=20 {
		router.publish(&conv("c1"), message("c1", seq));
	}

	let mut seen = Vec::new();
	while let Ok(Some(FanoutEvent::Message(m))) = timeout(Duration::from_millis(50), rx.recv()).await {
		seen.push(m.seq);
	}
	assert_eq!(seen, (1..=20).collect::<Vec<Seq>>());
}

#[tokio::test]
async fn full_queue_evicts_connection_without_blocking() {
	let router = router(2);
	let mut slow = router.register(&user("slow"), ConnectionId(1));
	let mut fast = router.register(&user("fast"), ConnectionId(2));
	router.subscribe(ConnectionId(1), &conv("c1"));
	router.subscribe(ConnectionId(2), &conv("c1"));

	router.publish(&conv("c1"), message("c1", 1));
	router.publish(&conv("c1"), message("c1", 2));
	// Drain the fast consumer so only the slow one overflows.
	fast.recv().await.expect("m1");
	fast.recv().await.expect("m2");

	let report = router.publish(&conv("c1"), message("c1", 3));
	assert_eq!(report.delivered, 1);
	assert_eq!(report.evicted, vec![(ConnectionId(1), user("slow"))]);
	assert!(!router.is_registered(ConnectionId(1)));
	assert_eq!(router.subscriber_count(&conv("c1")), 1);

	// The evicted queue drains what it had, then closes.
	assert!(slow.recv().await.is_some());
	assert!(slow.recv().await.is_some());
	assert!(slow.recv().await.is_none());
}

#[tokio::test]
async fn eviction_fires_close_signal_before_queue_drains() {
	let router = router(1);
	let (mut queue, mut closed) = router.register_session(&user("slow"), ConnectionId(1));
	router.subscribe(ConnectionId(1), &conv("c1"));

	router.publish(&conv("c1"), message("c1", 1));
	assert!(timeout(Duration::from_millis(50), &mut closed).await.is_err(), "closed while still registered");

	let report = router.publish(&conv("c1"), message("c1", 2));
	assert_eq!(report.evicted.len(), 1);
	timeout(Duration::from_millis(250), &mut closed)
		.await
		.expect("close signal after eviction")
		.expect_err("sender dropped, nothing sent");

	// The stale item is still queued; the signal did not wait for it.
	assert!(queue.recv().await.is_some());
	assert!(queue.recv().await.is_none());
}

#[tokio::test]
async fn unregister_clears_subscriptions() {
	let router = router(4);
	let _rx = router.register(&user("a"), ConnectionId(1));
	router.subscribe(ConnectionId(1), &conv("c1"));
	router.subscribe(ConnectionId(1), &conv("c2"));

	assert_eq!(router.unregister(ConnectionId(1)), Some(user("a")));
	assert_eq!(router.subscriber_count(&conv("c1")), 0);
	assert_eq!(router.subscriber_count(&conv("c2")), 0);
	assert!(router.connections_of(&user("a")).is_empty());
	assert!(!router.subscribe(ConnectionId(1), &conv("c1")));
}

#[tokio::test]
async fn deliver_to_user_hits_every_connection() {
	let router = router(4);
	let mut rx1 = router.register(&user("a"), ConnectionId(1));
	let mut rx2 = router.register(&user("a"), ConnectionId(2));

	let report = router.deliver_to_user(
		&user("a"),
		FanoutEvent::Presence {
			user_id: user("b"),
			snapshot: PresenceSnapshot::unknown(),
		},
	);
	assert_eq!(report.delivered, 2);
	assert!(matches!(rx1.recv().await, Some(FanoutEvent::Presence { .. })));
	assert!(matches!(rx2.recv().await, Some(FanoutEvent::Presence { .. })));
}
