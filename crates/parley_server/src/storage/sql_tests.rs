#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{ConversationId, IdempotencyToken, UserId};

use crate::server::log::{AppendRequest, DeliveryLog, LogConfig, LogError};
use crate::server::registry::ConversationRegistry;
use crate::storage::{Database, SqlLogBackend, SqlRegistryBackend};

async fn memory_db() -> Database {
	Database::connect("sqlite::memory:", 1).await.expect("sqlite in memory")
}

fn conv() -> ConversationId {
	ConversationId::new("c1").expect("valid ConversationId")
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn request(sender: &str, content: &str, token: &str) -> AppendRequest {
	AppendRequest {
		conversation_id: conv(),
		sender_id: user(sender),
		content: content.to_string(),
		idempotency_token: IdempotencyToken::new(token),
		revises: None,
		created_at_unix_ms: 1_000,
	}
}

fn sql_log(db: &Database) -> DeliveryLog {
	DeliveryLog::new(Arc::new(SqlLogBackend::new(db.clone())), LogConfig::default())
}

#[tokio::test]
async fn sql_log_sequences_and_deduplicates() {
	let db = memory_db().await;
	let log = sql_log(&db);

	for (i, body) in ["a", "b", "c"].iter().enumerate() {
		let appended = log.append(request("alice", body, &format!("t{i}"))).await.unwrap();
		assert_eq!(appended.message.seq, i as u64 + 1);
	}

	let again = log.append(request("alice", "b", "t1")).await.unwrap();
	assert!(again.duplicate);
	assert_eq!(again.message.seq, 2);

	let err = log.append(request("alice", "changed", "t1")).await.unwrap_err();
	assert_eq!(err, LogError::Conflict { seq: 2 });

	// Same token from someone else is a different send.
	let other = log.append(request("bob", "b", "t1")).await.unwrap();
	assert!(!other.duplicate);
	assert_eq!(other.message.seq, 4);
	assert_eq!(log.head(&conv()).await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sql_log_concurrent_appends_stay_gapless() {
	let db = memory_db().await;
	let log = Arc::new(sql_log(&db));

	let mut tasks = Vec::new();
	for i in 0..16 {
		let log = Arc::clone(&log);
		tasks.push(tokio::spawn(async move {
			log.append(request("alice", &format!("m{i}"), "")).await.unwrap().message.seq
		}));
	}
	let mut seqs = Vec::new();
	for task in tasks {
		seqs.push(task.await.unwrap());
	}
	seqs.sort_unstable();
	assert_eq!(seqs, (1..=16).collect::<Vec<_>>());
}

#[tokio::test]
async fn sql_log_delete_purge_and_last_message() {
	let db = memory_db().await;
	let log = sql_log(&db);
	for i in 1..=5 {
		log.append(request("alice", &format!("m{i}"), "")).await.unwrap();
	}

	let (deleted, ()) = log.delete_and_then(&conv(), 5, |_| ()).await.unwrap();
	assert!(deleted.deleted);
	assert_eq!(log.last_message(&conv()).await.unwrap().map(|m| m.seq), Some(4));

	assert_eq!(log.purge_history(&conv(), 2).await.unwrap(), 2);
	assert_eq!(log.oldest_available(&conv()).await.unwrap(), 3);
	assert_eq!(log.head(&conv()).await.unwrap(), 5);

	let seqs: Vec<_> = log
		.read_range(&conv(), 1, 5)
		.await
		.unwrap()
		.into_iter()
		.map(|m| m.seq)
		.collect();
	assert_eq!(seqs, vec![3, 4, 5]);

	// The head survives a full purge; new messages continue after it.
	log.purge_history(&conv(), 5).await.unwrap();
	assert_eq!(log.oldest_available(&conv()).await.unwrap(), 6);
	let next = log.append(request("alice", "after purge", "")).await.unwrap();
	assert_eq!(next.message.seq, 6);
}

#[tokio::test]
async fn sql_registry_survives_restart() {
	let db = memory_db().await;
	let backend = Arc::new(SqlRegistryBackend::new(db.clone()));
	let registry = ConversationRegistry::new(backend);

	let (direct, created) = registry.create_direct(&user("a"), &user("b"), 10).await.unwrap();
	assert!(created);
	let group = registry
		.create_group(&user("a"), vec![user("b"), user("c")], Some("crew".into()), 20)
		.await
		.unwrap();
	registry.remove_member(&group.id, &user("a"), &user("c")).await.unwrap();
	registry.mark_read(&direct.id, &user("b"), 3).await.unwrap();
	registry.set_archived(&group.id, &user("b"), true).await.unwrap();
	registry.touch_activity(&direct.id, 99).await.unwrap();

	let restarted = ConversationRegistry::hydrate(Arc::new(SqlRegistryBackend::new(db.clone())))
		.await
		.unwrap();

	let stored_direct = restarted.get(&direct.id).expect("direct restored");
	assert_eq!(stored_direct.last_activity_unix_ms, 99);
	assert_eq!(stored_direct.member(&user("b")).map(|m| m.last_read_seq), Some(3));

	let stored_group = restarted.get(&group.id).expect("group restored");
	assert!(stored_group.is_archived_for(&user("b")));
	assert!(!stored_group.is_archived_for(&user("a")));
	assert_eq!(stored_group.title.as_deref(), Some("crew"));
	assert!(!stored_group.is_member(&user("c")));

	let (again, created) = restarted.create_direct(&user("b"), &user("a"), 30).await.unwrap();
	assert!(!created);
	assert_eq!(again.id, direct.id);
}

#[tokio::test]
async fn sql_registry_direct_converges_across_instances() {
	let db = memory_db().await;
	let first = ConversationRegistry::new(Arc::new(SqlRegistryBackend::new(db.clone())));
	let second = ConversationRegistry::new(Arc::new(SqlRegistryBackend::new(db.clone())));

	let (a, created_a) = first.create_direct(&user("a"), &user("b"), 1).await.unwrap();
	let (b, created_b) = second.create_direct(&user("b"), &user("a"), 2).await.unwrap();

	assert!(created_a);
	assert!(!created_b, "the unique direct key resolves to the stored conversation");
	assert_eq!(a.id, b.id);
	assert!(second.shares_conversation(&user("a"), &user("b")));
}

#[tokio::test]
async fn unsupported_database_url_is_rejected() {
	let err = Database::connect("mysql://localhost/parley", 1).await.unwrap_err();
	assert!(err.to_string().contains("unsupported database_url"));
}
