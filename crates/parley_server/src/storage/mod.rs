#![forbid(unsafe_code)]

//! SQL persistence for the delivery log and the conversation registry.
//!
//! Queries use `$n` placeholders, which both SQLite and Postgres accept.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use crate::server::health::HealthState;

#[derive(Clone, Debug)]
pub enum Database {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Run `$body` against whichever pool backs `$db`, bound as `$pool`.
macro_rules! with_pool {
	($db:expr, |$pool:ident| $body:expr) => {
		match $db {
			$crate::storage::Database::Sqlite($pool) => $body,
			$crate::storage::Database::Postgres($pool) => $body,
		}
	};
}

pub mod log_sql;
pub mod registry_sql;

#[cfg(test)]
mod sql_tests;

pub use log_sql::SqlLogBackend;
pub use registry_sql::SqlRegistryBackend;

impl Database {
	/// Connect and run migrations. Accepts `sqlite:` and `postgres:` URLs.
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			// Every connection to `:memory:` is its own database.
			let pool_opts = if database_url.contains(":memory:") {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
			} else {
				SqlitePoolOptions::new().max_connections(max_connections.max(1))
			};

			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			info!("storage: sqlite ready");
			Ok(Database::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(max_connections.max(1))
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			info!("storage: postgres ready");
			Ok(Database::Postgres(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:)"))
		}
	}

	pub async fn ping(&self) -> anyhow::Result<()> {
		with_pool!(self, |pool| {
			sqlx::query("SELECT 1").execute(pool).await.context("storage ping")?;
		});
		Ok(())
	}
}

/// Periodically ping storage and reflect the result in readiness.
pub fn spawn_storage_probe(db: Database, health: HealthState, interval: Duration) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(interval);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			match db.ping().await {
				Ok(()) => health.set_storage_ok(true),
				Err(e) => {
					warn!(error = %format!("{e:#}"), "storage probe failed");
					health.set_storage_ok(false);
				}
			}
		}
	})
}

pub(crate) fn to_db_seq(seq: u64) -> i64 {
	i64::try_from(seq).unwrap_or(i64::MAX)
}

pub(crate) fn from_db_seq(seq: i64) -> u64 {
	u64::try_from(seq).unwrap_or(0)
}
