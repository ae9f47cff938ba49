#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parley_domain::{ConnectionId, ConversationId, Message, PresenceSnapshot, Seq, UserId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Items pushed to a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum FanoutEvent {
	Message(Arc<Message>),
	MessageDeleted {
		conversation_id: ConversationId,
		seq: Seq,
	},
	Presence {
		user_id: UserId,
		snapshot: PresenceSnapshot,
	},
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
	/// Maximum number of queued events per connection before it is evicted.
	pub outbound_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for FanoutConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
	pub delivered: usize,
	/// Connections dropped for a full queue, with their users.
	pub evicted: Vec<(ConnectionId, UserId)>,
}

#[derive(Debug)]
struct ConnectionEntry {
	user: UserId,
	tx: mpsc::Sender<FanoutEvent>,
	conversations: HashSet<ConversationId>,
	// Dropped with the entry, which wakes the session at once.
	_closed: oneshot::Sender<()>,
}

/// Routes conversation events to subscribed connections.
///
/// Publishing never blocks: a connection whose queue is full is evicted. Its
/// close signal fires straight away, without waiting for the queue to drain.
#[derive(Debug)]
pub struct FanoutRouter {
	connections: DashMap<ConnectionId, ConnectionEntry>,
	by_conversation: DashMap<ConversationId, HashSet<ConnectionId>>,
	by_user: DashMap<UserId, HashSet<ConnectionId>>,
	cfg: FanoutConfig,
}

impl FanoutRouter {
	pub fn new(cfg: FanoutConfig) -> Self {
		Self {
			connections: DashMap::new(),
			by_conversation: DashMap::new(),
			by_user: DashMap::new(),
			cfg,
		}
	}

	pub fn register(&self, user: &UserId, conn: ConnectionId) -> mpsc::Receiver<FanoutEvent> {
		self.register_session(user, conn).0
	}

	/// Register a connection and return its queue plus a signal that resolves
	/// once the connection is unregistered for any reason.
	pub fn register_session(
		&self,
		user: &UserId,
		conn: ConnectionId,
	) -> (mpsc::Receiver<FanoutEvent>, oneshot::Receiver<()>) {
		let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_capacity.max(1));
		let (closed_tx, closed_rx) = oneshot::channel();
		self.connections.insert(
			conn,
			ConnectionEntry {
				user: user.clone(),
				tx,
				conversations: HashSet::new(),
				_closed: closed_tx,
			},
		);
		self.by_user.entry(user.clone()).or_default().insert(conn);

		if self.cfg.debug_logs {
			debug!(%conn, user_id = %user, "fanout: registered");
		}
		(rx, closed_rx)
	}

	/// Remove a connection and all of its subscriptions. Returns its user.
	pub fn unregister(&self, conn: ConnectionId) -> Option<UserId> {
		let (_, entry) = self.connections.remove(&conn)?;

		for conversation in &entry.conversations {
			if let Some(mut conns) = self.by_conversation.get_mut(conversation) {
				conns.remove(&conn);
			}
			self.by_conversation.remove_if(conversation, |_, conns| conns.is_empty());
		}

		if let Some(mut conns) = self.by_user.get_mut(&entry.user) {
			conns.remove(&conn);
		}
		self.by_user.remove_if(&entry.user, |_, conns| conns.is_empty());

		if self.cfg.debug_logs {
			debug!(%conn, user_id = %entry.user, "fanout: unregistered");
		}
		Some(entry.user)
	}

	/// Returns `false` if the connection is not registered.
	pub fn subscribe(&self, conn: ConnectionId, conversation: &ConversationId) -> bool {
		{
			let Some(mut entry) = self.connections.get_mut(&conn) else {
				return false;
			};
			entry.conversations.insert(conversation.clone());
		}
		self.by_conversation
			.entry(conversation.clone())
			.or_default()
			.insert(conn);
		true
	}

	pub fn unsubscribe(&self, conn: ConnectionId, conversation: &ConversationId) {
		if let Some(mut entry) = self.connections.get_mut(&conn) {
			entry.conversations.remove(conversation);
		}
		if let Some(mut conns) = self.by_conversation.get_mut(conversation) {
			conns.remove(&conn);
		}
		self.by_conversation.remove_if(conversation, |_, conns| conns.is_empty());
	}

	/// Drop every subscription `user` holds on `conversation` (after leaving it).
	pub fn unsubscribe_user(&self, user: &UserId, conversation: &ConversationId) {
		for conn in self.connections_of(user) {
			self.unsubscribe(conn, conversation);
		}
	}

	pub fn is_registered(&self, conn: ConnectionId) -> bool {
		self.connections.contains_key(&conn)
	}

	pub fn is_subscribed(&self, conn: ConnectionId, conversation: &ConversationId) -> bool {
		self.connections
			.get(&conn)
			.is_some_and(|entry| entry.conversations.contains(conversation))
	}

	pub fn connections_of(&self, user: &UserId) -> Vec<ConnectionId> {
		self.by_user
			.get(user)
			.map(|conns| conns.iter().copied().collect())
			.unwrap_or_default()
	}

	pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
		self.by_conversation.get(conversation).map(|c| c.len()).unwrap_or(0)
	}

	/// Push `event` to every connection subscribed to `conversation`.
	pub fn publish(&self, conversation: &ConversationId, event: FanoutEvent) -> PublishReport {
		let targets: Vec<ConnectionId> = match self.by_conversation.get(conversation) {
			Some(conns) => conns.iter().copied().collect(),
			None => return PublishReport::default(),
		};
		self.send_to(targets, event)
	}

	/// Push `event` to every live connection of `user`.
	pub fn deliver_to_user(&self, user: &UserId, event: FanoutEvent) -> PublishReport {
		let targets = self.connections_of(user);
		self.send_to(targets, event)
	}

	fn send_to(&self, targets: Vec<ConnectionId>, event: FanoutEvent) -> PublishReport {
		let mut report = PublishReport::default();

		for conn in targets {
			let outcome = match self.connections.get(&conn) {
				Some(entry) => entry.tx.try_send(event.clone()),
				None => continue,
			};

			match outcome {
				Ok(()) => report.delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					metrics::counter!("parley_server_fanout_evictions_total").increment(1);
					if let Some(user) = self.unregister(conn) {
						warn!(%conn, user_id = %user, "fanout: outbound queue full; connection evicted");
						report.evicted.push((conn, user));
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					self.unregister(conn);
				}
			}
		}

		report
	}
}
