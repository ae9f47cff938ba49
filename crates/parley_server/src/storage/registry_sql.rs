#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::Context as _;
use async_trait::async_trait;
use parley_domain::{Conversation, ConversationId, ConversationKind, DirectKey, Member, Seq, UserId};

use crate::server::registry::{InsertOutcome, RegistryBackend};
use crate::storage::{Database, from_db_seq, to_db_seq};

type ConversationRow = (String, String, Option<String>, i64, i64);
type MemberRow = (String, String, i64, i64, bool);

const CONVERSATION_COLUMNS: &str = "id, kind, title, created_at_ms, last_activity_ms";
const MEMBER_COLUMNS: &str = "conversation_id, user_id, joined_at_ms, last_read_seq, archived";

fn conversation_from_rows(row: ConversationRow, members: Vec<Member>) -> anyhow::Result<Conversation> {
	let (id, kind, title, created_at_ms, last_activity_ms) = row;
	Ok(Conversation {
		id: ConversationId::new(id).context("stored conversation id")?,
		kind: kind.parse::<ConversationKind>().context("stored conversation kind")?,
		title,
		members,
		created_at_unix_ms: created_at_ms,
		last_activity_unix_ms: last_activity_ms,
	})
}

fn member_from_row(row: MemberRow) -> anyhow::Result<(String, Member)> {
	let (conversation_id, user_id, joined_at_ms, last_read_seq, archived) = row;
	Ok((
		conversation_id,
		Member {
			user_id: UserId::new(user_id).context("stored member id")?,
			joined_at_unix_ms: joined_at_ms,
			last_read_seq: from_db_seq(last_read_seq),
			archived,
		},
	))
}

/// Conversations and memberships in SQL. The `direct_key` unique index keeps one direct per pair.
#[derive(Clone, Debug)]
pub struct SqlRegistryBackend {
	db: Database,
}

impl SqlRegistryBackend {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

#[async_trait]
impl RegistryBackend for SqlRegistryBackend {
	async fn load_all(&self) -> anyhow::Result<Vec<Conversation>> {
		let conversations_sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY id");
		let members_sql =
			format!("SELECT {MEMBER_COLUMNS} FROM conversation_members ORDER BY conversation_id, joined_at_ms, user_id");

		let (rows, member_rows): (Vec<ConversationRow>, Vec<MemberRow>) = with_pool!(&self.db, |pool| {
			let rows = sqlx::query_as(&conversations_sql)
				.fetch_all(pool)
				.await
				.context("select conversations")?;
			let member_rows = sqlx::query_as(&members_sql)
				.fetch_all(pool)
				.await
				.context("select members")?;
			(rows, member_rows)
		});

		let mut members: HashMap<String, Vec<Member>> = HashMap::new();
		for row in member_rows {
			let (conversation_id, member) = member_from_row(row)?;
			members.entry(conversation_id).or_default().push(member);
		}

		rows.into_iter()
			.map(|row| {
				let list = members.remove(&row.0).unwrap_or_default();
				conversation_from_rows(row, list)
			})
			.collect()
	}

	async fn load_conversation(&self, id: &ConversationId) -> anyhow::Result<Option<Conversation>> {
		let conversation_sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1");
		let members_sql = format!(
			"SELECT {MEMBER_COLUMNS} FROM conversation_members WHERE conversation_id = $1 ORDER BY joined_at_ms, user_id"
		);

		let (row, member_rows): (Option<ConversationRow>, Vec<MemberRow>) = with_pool!(&self.db, |pool| {
			let row = sqlx::query_as(&conversation_sql)
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.context("select conversation")?;
			let member_rows = sqlx::query_as(&members_sql)
				.bind(id.as_str())
				.fetch_all(pool)
				.await
				.context("select conversation members")?;
			(row, member_rows)
		});

		let Some(row) = row else {
			return Ok(None);
		};
		let members = member_rows
			.into_iter()
			.map(|r| member_from_row(r).map(|(_, m)| m))
			.collect::<anyhow::Result<Vec<_>>>()?;
		conversation_from_rows(row, members).map(Some)
	}

	async fn insert_conversation(
		&self,
		conversation: &Conversation,
		direct_key: Option<&DirectKey>,
	) -> anyhow::Result<InsertOutcome> {
		let direct_key = direct_key.map(|k| k.as_str().to_string());

		with_pool!(&self.db, |pool| {
			let mut tx = pool.begin().await.context("begin conversation insert tx")?;
			let inserted = sqlx::query(
				"INSERT INTO conversations (id, kind, title, direct_key, created_at_ms, last_activity_ms) \
				VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
			)
			.bind(conversation.id.as_str())
			.bind(conversation.kind.as_str())
			.bind(conversation.title.as_deref())
			.bind(direct_key.as_deref())
			.bind(conversation.created_at_unix_ms)
			.bind(conversation.last_activity_unix_ms)
			.execute(&mut *tx)
			.await
			.context("insert conversation")?
			.rows_affected();

			if inserted == 0 {
				let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM conversations WHERE direct_key = $1")
					.bind(direct_key.as_deref())
					.fetch_optional(&mut *tx)
					.await
					.context("select existing direct conversation")?;
				tx.rollback().await.context("rollback conversation insert tx")?;

				let Some((id,)) = existing else {
					anyhow::bail!("conversation {} already exists", conversation.id);
				};
				return Ok(InsertOutcome::Existing(ConversationId::new(id).context("stored conversation id")?));
			}

			for member in &conversation.members {
				sqlx::query(
					"INSERT INTO conversation_members (conversation_id, user_id, joined_at_ms, last_read_seq, archived) \
					VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(conversation.id.as_str())
				.bind(member.user_id.as_str())
				.bind(member.joined_at_unix_ms)
				.bind(to_db_seq(member.last_read_seq))
				.bind(member.archived)
				.execute(&mut *tx)
				.await
				.context("insert conversation member")?;
			}

			tx.commit().await.context("commit conversation insert tx")?;
		});

		Ok(InsertOutcome::Inserted)
	}

	async fn add_member(&self, conversation: &ConversationId, member: &Member) -> anyhow::Result<()> {
		with_pool!(&self.db, |pool| {
			sqlx::query(
				"INSERT INTO conversation_members (conversation_id, user_id, joined_at_ms, last_read_seq, archived) \
				VALUES ($1, $2, $3, $4, $5) ON CONFLICT (conversation_id, user_id) DO NOTHING",
			)
			.bind(conversation.as_str())
			.bind(member.user_id.as_str())
			.bind(member.joined_at_unix_ms)
			.bind(to_db_seq(member.last_read_seq))
			.bind(member.archived)
			.execute(pool)
			.await
			.context("insert member")?;
		});
		Ok(())
	}

	async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> anyhow::Result<()> {
		with_pool!(&self.db, |pool| {
			sqlx::query("DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2")
				.bind(conversation.as_str())
				.bind(user.as_str())
				.execute(pool)
				.await
				.context("delete member")?;
		});
		Ok(())
	}

	async fn set_archived(&self, conversation: &ConversationId, user: &UserId, archived: bool) -> anyhow::Result<()> {
		with_pool!(&self.db, |pool| {
			sqlx::query("UPDATE conversation_members SET archived = $1 WHERE conversation_id = $2 AND user_id = $3")
				.bind(archived)
				.bind(conversation.as_str())
				.bind(user.as_str())
				.execute(pool)
				.await
				.context("update archived")?;
		});
		Ok(())
	}

	async fn set_last_read(&self, conversation: &ConversationId, user: &UserId, seq: Seq) -> anyhow::Result<()> {
		with_pool!(&self.db, |pool| {
			sqlx::query(
				"UPDATE conversation_members SET last_read_seq = $1 \
				WHERE conversation_id = $2 AND user_id = $3 AND last_read_seq < $1",
			)
			.bind(to_db_seq(seq))
			.bind(conversation.as_str())
			.bind(user.as_str())
			.execute(pool)
			.await
			.context("update read cursor")?;
		});
		Ok(())
	}

	async fn touch_activity(&self, conversation: &ConversationId, at_unix_ms: i64) -> anyhow::Result<()> {
		with_pool!(&self.db, |pool| {
			sqlx::query("UPDATE conversations SET last_activity_ms = $1 WHERE id = $2 AND last_activity_ms < $1")
				.bind(at_unix_ms)
				.bind(conversation.as_str())
				.execute(pool)
				.await
				.context("update last activity")?;
		});
		Ok(())
	}
}
