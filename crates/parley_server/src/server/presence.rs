#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parley_domain::{ConnectionId, PresenceSnapshot, PresenceStatus, UserId};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PresenceError {
	#[error("connection {conn} is not registered for user {user}")]
	UnknownConnection { user: UserId, conn: ConnectionId },
}

/// Outcome of a connect/disconnect as seen by presence watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
	WentOnline,
	WentOffline { last_seen_unix_ms: i64 },
	Unchanged,
}

#[derive(Debug, Default)]
struct PresenceRecord {
	connections: HashSet<ConnectionId>,
	last_seen_unix_ms: Option<i64>,
}

#[derive(Debug, Clone)]
struct Heartbeat {
	user: UserId,
	last: Instant,
}

/// Per-user presence derived from live connections.
///
/// Each user's record sits in its own dashmap shard entry, so transitions for
/// one user are atomic without a global lock.
#[derive(Debug, Default)]
pub struct PresenceTracker {
	records: DashMap<UserId, PresenceRecord>,
	heartbeats: DashMap<ConnectionId, Heartbeat>,

	/// target -> viewers
	watchers: DashMap<UserId, HashSet<UserId>>,
	/// viewer -> targets
	watching: DashMap<UserId, HashSet<UserId>>,
}

impl PresenceTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_online(&self, user: &UserId, conn: ConnectionId, now: Instant) -> PresenceTransition {
		self.heartbeats.insert(
			conn,
			Heartbeat {
				user: user.clone(),
				last: now,
			},
		);

		let mut record = self.records.entry(user.clone()).or_default();
		let was_online = !record.connections.is_empty();
		record.connections.insert(conn);

		if was_online {
			PresenceTransition::Unchanged
		} else {
			metrics::gauge!("parley_server_presence_online_users").increment(1.0);
			debug!(user_id = %user, %conn, "presence: online");
			PresenceTransition::WentOnline
		}
	}

	/// Drop one connection. The user goes offline only when it was the last one.
	pub fn mark_offline(
		&self,
		user: &UserId,
		conn: ConnectionId,
		now_unix_ms: i64,
	) -> Result<PresenceTransition, PresenceError> {
		self.heartbeats.remove(&conn);

		let unknown = || PresenceError::UnknownConnection {
			user: user.clone(),
			conn,
		};

		let mut record = self.records.get_mut(user).ok_or_else(unknown)?;
		if !record.connections.remove(&conn) {
			return Err(unknown());
		}

		if !record.connections.is_empty() {
			return Ok(PresenceTransition::Unchanged);
		}

		record.last_seen_unix_ms = Some(now_unix_ms);
		metrics::gauge!("parley_server_presence_online_users").decrement(1.0);
		debug!(user_id = %user, %conn, last_seen = now_unix_ms, "presence: offline");
		Ok(PresenceTransition::WentOffline {
			last_seen_unix_ms: now_unix_ms,
		})
	}

	pub fn status(&self, user: &UserId) -> PresenceSnapshot {
		match self.records.get(user) {
			Some(record) => PresenceSnapshot {
				status: if record.connections.is_empty() {
					PresenceStatus::Offline
				} else {
					PresenceStatus::Online
				},
				last_seen_unix_ms: record.last_seen_unix_ms,
			},
			None => PresenceSnapshot::unknown(),
		}
	}

	pub fn connection_count(&self, user: &UserId) -> usize {
		self.records.get(user).map(|r| r.connections.len()).unwrap_or(0)
	}

	/// Refresh the idle timer of a connection. Returns `false` for unknown connections.
	pub fn touch(&self, conn: ConnectionId, now: Instant) -> bool {
		match self.heartbeats.get_mut(&conn) {
			Some(mut hb) => {
				hb.last = now;
				true
			}
			None => false,
		}
	}

	/// Connections whose last heartbeat is older than `idle_timeout`.
	pub fn idle_connections(&self, now: Instant, idle_timeout: Duration) -> Vec<(UserId, ConnectionId)> {
		self.heartbeats
			.iter()
			.filter(|hb| now.saturating_duration_since(hb.last) >= idle_timeout)
			.map(|hb| (hb.user.clone(), *hb.key()))
			.collect()
	}

	/// Record that `viewer` wants updates about `target`.
	///
	/// The caller decides whether the pair is allowed to see each other.
	pub fn subscribe_to_presence(&self, viewer: &UserId, target: &UserId) {
		self.watchers.entry(target.clone()).or_default().insert(viewer.clone());
		self.watching.entry(viewer.clone()).or_default().insert(target.clone());
	}

	pub fn unsubscribe_from_presence(&self, viewer: &UserId, target: &UserId) {
		if let Some(mut viewers) = self.watchers.get_mut(target) {
			viewers.remove(viewer);
		}
		self.watchers.remove_if(target, |_, viewers| viewers.is_empty());

		if let Some(mut targets) = self.watching.get_mut(viewer) {
			targets.remove(target);
		}
		self.watching.remove_if(viewer, |_, targets| targets.is_empty());
	}

	pub fn viewers_of(&self, target: &UserId) -> Vec<UserId> {
		self.watchers
			.get(target)
			.map(|viewers| viewers.iter().cloned().collect())
			.unwrap_or_default()
	}

	/// Drop every watch registered by `viewer`.
	pub fn forget_viewer(&self, viewer: &UserId) {
		let Some((_, targets)) = self.watching.remove(viewer) else {
			return;
		};
		for target in targets {
			if let Some(mut viewers) = self.watchers.get_mut(&target) {
				viewers.remove(viewer);
			}
			self.watchers.remove_if(&target, |_, viewers| viewers.is_empty());
		}
	}
}
