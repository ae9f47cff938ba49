#![forbid(unsafe_code)]

use parley_protocol::pb;

/// Steps through search hits with wrap-around, the way the chat view's search bar does.
#[derive(Debug, Default, Clone)]
pub struct SearchNavigator {
	results: Vec<pb::MessageRecord>,
	current: Option<usize>,
}

impl SearchNavigator {
	/// Replace the result set; the first hit becomes current.
	pub fn new(results: Vec<pb::MessageRecord>) -> Self {
		let current = (!results.is_empty()).then_some(0);
		Self { results, current }
	}

	pub fn current(&self) -> Option<&pb::MessageRecord> {
		self.current.and_then(|i| self.results.get(i))
	}

	pub fn next(&mut self) -> Option<&pb::MessageRecord> {
		let len = self.results.len();
		if len == 0 {
			return None;
		}
		self.current = Some(self.current.map_or(0, |i| (i + 1) % len));
		self.current()
	}

	pub fn prev(&mut self) -> Option<&pb::MessageRecord> {
		let len = self.results.len();
		if len == 0 {
			return None;
		}
		self.current = Some(match self.current {
			Some(0) | None => len - 1,
			Some(i) => i - 1,
		});
		self.current()
	}

	/// `(1-based position, total)` for an "n of m" label.
	pub fn position(&self) -> Option<(usize, usize)> {
		self.current.map(|i| (i + 1, self.results.len()))
	}

	pub fn len(&self) -> usize {
		self.results.len()
	}

	pub fn is_empty(&self) -> bool {
		self.results.is_empty()
	}

	pub fn clear(&mut self) {
		self.results.clear();
		self.current = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hits(seqs: &[u64]) -> Vec<pb::MessageRecord> {
		seqs.iter()
			.map(|&seq| pb::MessageRecord {
				seq,
				..Default::default()
			})
			.collect()
	}

	#[test]
	fn wraps_in_both_directions() {
		let mut nav = SearchNavigator::new(hits(&[2, 5, 9]));
		assert_eq!(nav.position(), Some((1, 3)));
		assert_eq!(nav.prev().map(|m| m.seq), Some(9));
		assert_eq!(nav.next().map(|m| m.seq), Some(2));
		assert_eq!(nav.next().map(|m| m.seq), Some(5));
		assert_eq!(nav.position(), Some((2, 3)));
	}

	#[test]
	fn empty_results_have_no_position() {
		let mut nav = SearchNavigator::new(Vec::new());
		assert!(nav.next().is_none());
		assert!(nav.prev().is_none());
		assert_eq!(nav.position(), None);

		let mut nav = SearchNavigator::new(hits(&[1]));
		nav.clear();
		assert!(nav.is_empty());
		assert!(nav.current().is_none());
	}
}
