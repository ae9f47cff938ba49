#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parley_protocol::pb;

/// What the caller should do with an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
	Apply,
	/// Already seen at or below the high-water mark.
	Duplicate,
	/// Catch-up for the conversation finished; live events follow.
	CaughtUp,
}

/// Per-conversation high-water marks, used to drop replays and to resume after reconnect.
#[derive(Debug, Default, Clone)]
pub struct CatchUpTracker {
	high_water: HashMap<String, u64>,
	caught_up: HashSet<String>,
}

impl CatchUpTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Start (or restart) tracking; never moves an existing mark backwards.
	pub fn track(&mut self, conversation_id: impl Into<String>, after_seq: u64) {
		let conversation_id = conversation_id.into();
		self.caught_up.remove(&conversation_id);
		let mark = self.high_water.entry(conversation_id).or_insert(after_seq);
		*mark = (*mark).max(after_seq);
	}

	pub fn forget(&mut self, conversation_id: &str) {
		self.high_water.remove(conversation_id);
		self.caught_up.remove(conversation_id);
	}

	pub fn observe(&mut self, event: &pb::Event) -> EventDisposition {
		match event.kind.as_ref() {
			Some(pb::event::Kind::Message(m)) => {
				let mark = self.high_water.entry(event.conversation_id.clone()).or_insert(0);
				if m.seq <= *mark {
					EventDisposition::Duplicate
				} else {
					*mark = m.seq;
					EventDisposition::Apply
				}
			}
			Some(pb::event::Kind::CaughtUp(c)) => {
				let mark = self.high_water.entry(event.conversation_id.clone()).or_insert(0);
				// Anything up to the head is either delivered or no longer retained.
				*mark = (*mark).max(c.head_seq);
				self.caught_up.insert(event.conversation_id.clone());
				EventDisposition::CaughtUp
			}
			_ => EventDisposition::Apply,
		}
	}

	pub fn high_water(&self, conversation_id: &str) -> Option<u64> {
		self.high_water.get(conversation_id).copied()
	}

	pub fn is_caught_up(&self, conversation_id: &str) -> bool {
		self.caught_up.contains(conversation_id)
	}

	/// `(conversation_id, after_seq)` pairs for a resubscribe, sorted by id.
	pub fn resume_points(&self) -> Vec<(String, u64)> {
		let mut points: Vec<_> = self.high_water.iter().map(|(c, s)| (c.clone(), *s)).collect();
		points.sort();
		points
	}
}
