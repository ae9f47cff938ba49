#![forbid(unsafe_code)]

use anyhow::Context as _;
use async_trait::async_trait;
use parley_domain::{ConversationId, IdempotencyToken, Message, Seq, UserId};

use crate::server::log::{AppendRequest, LogBackend};
use crate::storage::{Database, from_db_seq, to_db_seq};

type MessageRow = (String, i64, String, String, i64, String, bool, Option<i64>);

const MESSAGE_COLUMNS: &str =
	"conversation_id, seq, sender_id, content, created_at_ms, idempotency_token, deleted, revises";

fn message_from_row(row: MessageRow) -> anyhow::Result<Message> {
	let (conversation_id, seq, sender_id, content, created_at_ms, token, deleted, revises) = row;
	Ok(Message {
		conversation_id: ConversationId::new(conversation_id).context("stored conversation_id")?,
		seq: from_db_seq(seq),
		sender_id: UserId::new(sender_id).context("stored sender_id")?,
		content,
		created_at_unix_ms: created_at_ms,
		idempotency_token: IdempotencyToken::new(token),
		deleted,
		revises: revises.map(from_db_seq),
	})
}

/// Delivery log rows in SQL. Seqs come from `conversation_heads`, bumped in the insert transaction.
#[derive(Clone, Debug)]
pub struct SqlLogBackend {
	db: Database,
}

impl SqlLogBackend {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

#[async_trait]
impl LogBackend for SqlLogBackend {
	async fn find_by_token(
		&self,
		conversation: &ConversationId,
		sender: &UserId,
		token: &IdempotencyToken,
		not_before_unix_ms: i64,
	) -> anyhow::Result<Option<Message>> {
		let sql = format!(
			"SELECT {MESSAGE_COLUMNS} FROM messages \
			WHERE conversation_id = $1 AND sender_id = $2 AND idempotency_token = $3 AND created_at_ms >= $4 \
			ORDER BY seq DESC LIMIT 1"
		);
		let row: Option<MessageRow> = with_pool!(&self.db, |pool| {
			sqlx::query_as(&sql)
				.bind(conversation.as_str())
				.bind(sender.as_str())
				.bind(token.as_str())
				.bind(not_before_unix_ms)
				.fetch_optional(pool)
				.await
				.context("select message by token")?
		});
		row.map(message_from_row).transpose()
	}

	async fn append(&self, request: &AppendRequest) -> anyhow::Result<Message> {
		let insert = format!(
			"INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
		);
		let seq = with_pool!(&self.db, |pool| {
			let mut tx = pool.begin().await.context("begin append tx")?;
			let (seq,): (i64,) = sqlx::query_as(
				"INSERT INTO conversation_heads (conversation_id, head_seq) VALUES ($1, 1) \
				ON CONFLICT (conversation_id) DO UPDATE SET head_seq = conversation_heads.head_seq + 1 \
				RETURNING head_seq",
			)
			.bind(request.conversation_id.as_str())
			.fetch_one(&mut *tx)
			.await
			.context("bump conversation head")?;

			sqlx::query(&insert)
				.bind(request.conversation_id.as_str())
				.bind(seq)
				.bind(request.sender_id.as_str())
				.bind(request.content.as_str())
				.bind(request.created_at_unix_ms)
				.bind(request.idempotency_token.as_str())
				.bind(false)
				.bind(request.revises.map(to_db_seq))
				.execute(&mut *tx)
				.await
				.context("insert message")?;

			tx.commit().await.context("commit append tx")?;
			seq
		});

		Ok(Message {
			conversation_id: request.conversation_id.clone(),
			seq: from_db_seq(seq),
			sender_id: request.sender_id.clone(),
			content: request.content.clone(),
			created_at_unix_ms: request.created_at_unix_ms,
			idempotency_token: request.idempotency_token.clone(),
			deleted: false,
			revises: request.revises,
		})
	}

	async fn read_range(
		&self,
		conversation: &ConversationId,
		from: Seq,
		to: Seq,
		limit: usize,
	) -> anyhow::Result<Vec<Message>> {
		if from > to || limit == 0 {
			return Ok(Vec::new());
		}
		let sql = format!(
			"SELECT {MESSAGE_COLUMNS} FROM messages \
			WHERE conversation_id = $1 AND seq >= $2 AND seq <= $3 ORDER BY seq ASC LIMIT $4"
		);
		let rows: Vec<MessageRow> = with_pool!(&self.db, |pool| {
			sqlx::query_as(&sql)
				.bind(conversation.as_str())
				.bind(to_db_seq(from))
				.bind(to_db_seq(to))
				.bind(i64::try_from(limit).unwrap_or(i64::MAX))
				.fetch_all(pool)
				.await
				.context("select message range")?
		});
		rows.into_iter().map(message_from_row).collect()
	}

	async fn head(&self, conversation: &ConversationId) -> anyhow::Result<Seq> {
		let row: Option<(i64,)> = with_pool!(&self.db, |pool| {
			sqlx::query_as("SELECT head_seq FROM conversation_heads WHERE conversation_id = $1")
				.bind(conversation.as_str())
				.fetch_optional(pool)
				.await
				.context("select head")?
		});
		Ok(row.map(|(seq,)| from_db_seq(seq)).unwrap_or(0))
	}

	async fn oldest_available(&self, conversation: &ConversationId) -> anyhow::Result<Seq> {
		let (oldest,): (Option<i64>,) = with_pool!(&self.db, |pool| {
			sqlx::query_as("SELECT MIN(seq) FROM messages WHERE conversation_id = $1")
				.bind(conversation.as_str())
				.fetch_one(pool)
				.await
				.context("select oldest seq")?
		});
		match oldest {
			Some(seq) => Ok(from_db_seq(seq)),
			None => Ok(self.head(conversation).await? + 1),
		}
	}

	async fn get(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<Option<Message>> {
		let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 AND seq = $2");
		let row: Option<MessageRow> = with_pool!(&self.db, |pool| {
			sqlx::query_as(&sql)
				.bind(conversation.as_str())
				.bind(to_db_seq(seq))
				.fetch_optional(pool)
				.await
				.context("select message")?
		});
		row.map(message_from_row).transpose()
	}

	async fn mark_deleted(&self, conversation: &ConversationId, seq: Seq) -> anyhow::Result<bool> {
		let affected = with_pool!(&self.db, |pool| {
			sqlx::query("UPDATE messages SET deleted = $1 WHERE conversation_id = $2 AND seq = $3")
				.bind(true)
				.bind(conversation.as_str())
				.bind(to_db_seq(seq))
				.execute(pool)
				.await
				.context("soft-delete message")?
				.rows_affected()
		});
		Ok(affected > 0)
	}

	async fn purge_through(&self, conversation: &ConversationId, through: Seq) -> anyhow::Result<u64> {
		let affected = with_pool!(&self.db, |pool| {
			sqlx::query("DELETE FROM messages WHERE conversation_id = $1 AND seq <= $2")
				.bind(conversation.as_str())
				.bind(to_db_seq(through))
				.execute(pool)
				.await
				.context("purge messages")?
				.rows_affected()
		});
		Ok(affected)
	}

	async fn last_message(&self, conversation: &ConversationId) -> anyhow::Result<Option<Message>> {
		let sql = format!(
			"SELECT {MESSAGE_COLUMNS} FROM messages \
			WHERE conversation_id = $1 AND deleted = $2 ORDER BY seq DESC LIMIT 1"
		);
		let row: Option<MessageRow> = with_pool!(&self.db, |pool| {
			sqlx::query_as(&sql)
				.bind(conversation.as_str())
				.bind(false)
				.fetch_optional(pool)
				.await
				.context("select last message")?
		});
		row.map(message_from_row).transpose()
	}
}
