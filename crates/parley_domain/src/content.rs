#![forbid(unsafe_code)]

use thiserror::Error;

/// Default upper bound on message content, in Unicode code points.
pub const DEFAULT_MAX_CONTENT_CODE_POINTS: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
	#[error("content is empty")]
	Empty,

	#[error("content too large: len={len} max={max}")]
	TooLarge { len: usize, max: usize },
}

/// Validate message content against the code point bound.
///
/// Whitespace-only content counts as empty.
pub fn validate_content(content: &str, max_code_points: usize) -> Result<(), ContentError> {
	if content.trim().is_empty() {
		return Err(ContentError::Empty);
	}

	let len = content.chars().count();
	if len > max_code_points {
		return Err(ContentError::TooLarge {
			len,
			max: max_code_points,
		});
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_bound_is_accepted() {
		let s = "a".repeat(DEFAULT_MAX_CONTENT_CODE_POINTS);
		assert!(validate_content(&s, DEFAULT_MAX_CONTENT_CODE_POINTS).is_ok());
	}

	#[test]
	fn one_over_is_rejected() {
		let s = "a".repeat(DEFAULT_MAX_CONTENT_CODE_POINTS + 1);
		assert_eq!(
			validate_content(&s, DEFAULT_MAX_CONTENT_CODE_POINTS),
			Err(ContentError::TooLarge {
				len: DEFAULT_MAX_CONTENT_CODE_POINTS + 1,
				max: DEFAULT_MAX_CONTENT_CODE_POINTS,
			})
		);
	}

	#[test]
	fn counts_code_points_not_bytes() {
		// 4 bytes each in UTF-8.
		let s = "🦀".repeat(8);
		assert!(validate_content(&s, 8).is_ok());
		assert!(validate_content(&s, 7).is_err());
	}

	#[test]
	fn whitespace_is_empty() {
		assert_eq!(validate_content(" \n\t", 10), Err(ContentError::Empty));
	}
}
