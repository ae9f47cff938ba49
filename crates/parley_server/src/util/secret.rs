#![forbid(unsafe_code)]

use std::fmt;

/// String wrapper that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[cfg(test)]
mod tests {
	use super::SecretString;

	#[test]
	fn formatting_never_leaks() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert!(!format!("{s:?}").contains("hunter2"));
		assert_eq!(s.expose(), "hunter2");
	}
}
