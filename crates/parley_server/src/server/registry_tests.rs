#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{ConversationKind, UserId};
use proptest::prelude::*;

use crate::server::registry::{ConversationRegistry, PageCursor, RegistryError};

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

#[tokio::test]
async fn direct_is_idempotent_in_both_orders() {
	let registry = ConversationRegistry::in_memory();
	let (first, created) = registry.create_direct(&user("a"), &user("b"), 1).await.unwrap();
	assert!(created);
	let (second, created) = registry.create_direct(&user("b"), &user("a"), 2).await.unwrap();
	assert!(!created);

	assert_eq!(first.id, second.id);
	assert_eq!(first.kind, ConversationKind::Direct);
	assert_eq!(second.members.len(), 2);
}

#[tokio::test]
async fn direct_with_self_is_rejected() {
	let registry = ConversationRegistry::in_memory();
	let err = registry.create_direct(&user("a"), &user("a"), 1).await.unwrap_err();
	assert!(matches!(err, RegistryError::InvalidMembers(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_direct_creation_converges() {
	let registry = Arc::new(ConversationRegistry::in_memory());

	let mut tasks = Vec::new();
	for i in 0..32 {
		let registry = Arc::clone(&registry);
		tasks.push(tokio::spawn(async move {
			let (a, b) = if i % 2 == 0 { ("a", "b") } else { ("b", "a") };
			registry.create_direct(&user(a), &user(b), i).await.unwrap().0.id
		}));
	}

	let mut ids = Vec::new();
	for task in tasks {
		ids.push(task.await.unwrap());
	}
	ids.dedup();
	assert_eq!(ids.len(), 1, "all callers observe the same conversation");
	assert_eq!(registry.conversations_of(&user("a")).len(), 1);
}

#[tokio::test]
async fn group_needs_two_distinct_members() {
	let registry = ConversationRegistry::in_memory();
	let err = registry
		.create_group(&user("a"), vec![user("a")], None, 1)
		.await
		.unwrap_err();
	assert!(matches!(err, RegistryError::InvalidMembers(_)));

	let group = registry
		.create_group(&user("a"), vec![user("b"), user("a"), user("b")], Some("  Team ".into()), 1)
		.await
		.unwrap();
	let members: Vec<_> = group.member_ids().cloned().collect();
	assert_eq!(members, vec![user("a"), user("b")]);
	assert_eq!(group.title.as_deref(), Some("Team"));
}

#[tokio::test]
async fn membership_changes_and_inert_group() {
	let registry = ConversationRegistry::in_memory();
	let group = registry
		.create_group(&user("a"), vec![user("b")], None, 1)
		.await
		.unwrap();

	// Outsiders cannot add anyone.
	let err = registry.add_member(&group.id, &user("x"), &user("c"), 2).await.unwrap_err();
	assert!(matches!(err, RegistryError::NotAMember { .. }));

	let updated = registry.add_member(&group.id, &user("a"), &user("c"), 2).await.unwrap();
	assert!(updated.is_member(&user("c")));
	assert!(registry.shares_conversation(&user("b"), &user("c")));

	registry.remove_member(&group.id, &user("c"), &user("c")).await.unwrap();
	registry.remove_member(&group.id, &user("a"), &user("b")).await.unwrap();
	let last = registry.remove_member(&group.id, &user("a"), &user("a")).await.unwrap();
	assert!(last.is_inert());

	let err = registry.require_member(&group.id, &user("a")).unwrap_err();
	assert!(matches!(err, RegistryError::NotAMember { .. }));
	assert!(registry.conversations_of(&user("a")).is_empty());
}

#[tokio::test]
async fn direct_membership_is_fixed() {
	let registry = ConversationRegistry::in_memory();
	let (direct, _) = registry.create_direct(&user("a"), &user("b"), 1).await.unwrap();
	let err = registry.add_member(&direct.id, &user("a"), &user("c"), 2).await.unwrap_err();
	assert_eq!(err, RegistryError::NotAGroup);
}

#[tokio::test]
async fn read_cursor_only_moves_forward() {
	let registry = ConversationRegistry::in_memory();
	let (direct, _) = registry.create_direct(&user("a"), &user("b"), 1).await.unwrap();

	assert_eq!(registry.mark_read(&direct.id, &user("a"), 5).await.unwrap(), 5);
	assert_eq!(registry.mark_read(&direct.id, &user("a"), 3).await.unwrap(), 5);
	let member = registry.get(&direct.id).unwrap().member(&user("a")).cloned().unwrap();
	assert_eq!(member.last_read_seq, 5);

	let err = registry.mark_read(&direct.id, &user("z"), 1).await.unwrap_err();
	assert!(matches!(err, RegistryError::NotAMember { .. }));
}

#[tokio::test]
async fn listing_orders_by_activity_and_hides_archived() {
	let registry = ConversationRegistry::in_memory();
	let me = user("me");
	let mut ids = Vec::new();
	for (i, peer) in ["p1", "p2", "p3", "p4"].iter().enumerate() {
		let (c, _) = registry.create_direct(&me, &user(peer), i as i64).await.unwrap();
		ids.push(c.id);
	}
	registry.touch_activity(&ids[0], 100).await.unwrap();
	registry.set_archived(&ids[2], &me, true).await.unwrap();

	let page = registry.page_for(&me, None, 2);
	let first: Vec<_> = page.items.iter().map(|c| c.id.clone()).collect();
	assert_eq!(first, vec![ids[0].clone(), ids[3].clone()]);

	let cursor = page.next_cursor.expect("more pages");
	let decoded = PageCursor::decode(&cursor.encode()).unwrap();
	assert_eq!(decoded, cursor);

	let page = registry.page_for(&me, Some(&decoded), 2);
	let second: Vec<_> = page.items.iter().map(|c| c.id.clone()).collect();
	assert_eq!(second, vec![ids[1].clone()]);
	assert!(page.next_cursor.is_none());

	registry.set_archived(&ids[2], &me, false).await.unwrap();
	let all: Vec<_> = registry.pager(&me, 3).flatten().collect();
	assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn archiving_hides_only_the_archiving_member() {
	let registry = ConversationRegistry::in_memory();
	let group = registry
		.create_group(&user("a"), vec![user("b"), user("c")], None, 1)
		.await
		.unwrap();

	let updated = registry.set_archived(&group.id, &user("a"), true).await.unwrap();
	assert!(updated.is_archived_for(&user("a")));
	assert!(!updated.is_archived_for(&user("b")));

	assert!(registry.page_for(&user("a"), None, 10).items.is_empty());
	assert_eq!(registry.page_for(&user("b"), None, 10).items.len(), 1);
	assert_eq!(registry.page_for(&user("c"), None, 10).items.len(), 1);

	// A member added later starts unarchived.
	registry.add_member(&group.id, &user("b"), &user("d"), 2).await.unwrap();
	assert_eq!(registry.page_for(&user("d"), None, 10).items.len(), 1);

	let err = registry.set_archived(&group.id, &user("z"), true).await.unwrap_err();
	assert!(matches!(err, RegistryError::NotAMember { .. }));
}

#[test]
fn garbage_cursor_is_rejected() {
	assert_eq!(PageCursor::decode("%%%"), Err(RegistryError::InvalidCursor));
	assert_eq!(PageCursor::decode("bm8tcGlwZQ"), Err(RegistryError::InvalidCursor));
}

proptest! {
	#[test]
	fn pager_visits_every_conversation_once(activity in proptest::collection::vec(0i64..5, 1..25), page_size in 1usize..6) {
		let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
		rt.block_on(async {
			let registry = ConversationRegistry::in_memory();
			let me = user("me");
			for (i, at) in activity.iter().enumerate() {
				registry.create_direct(&me, &user(&format!("p{i}")), *at).await.unwrap();
			}

			let pages: Vec<_> = registry.pager(&me, page_size).collect();
			let seen: Vec<_> = pages.iter().flatten().map(|c| (c.last_activity_unix_ms, c.id.clone())).collect();

			prop_assert_eq!(seen.len(), activity.len());
			prop_assert!(pages.iter().all(|p| p.len() <= page_size));
			prop_assert!(seen.windows(2).all(|w| w[0].0 > w[1].0 || (w[0].0 == w[1].0 && w[0].1 < w[1].1)));
			Ok(())
		})?;
	}
}
