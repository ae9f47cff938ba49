#![forbid(unsafe_code)]

//! `quic://host:port` endpoint strings shared by the server CLI and clients.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected quic://host:port)")]
	Empty,
	#[error("invalid endpoint (expected quic://host:port): {0}")]
	Scheme(String),
	#[error("invalid endpoint (no path, query or fragment allowed): {0}")]
	Trailing(String),
	#[error("invalid endpoint host: {0}")]
	Host(String),
	#[error("IPv6 hosts must be bracketed like quic://[::1]:18300: {0}")]
	UnbracketedIpv6(String),
	#[error("invalid endpoint port (expected 1..=65535): {0}")]
	Port(String),
	#[error("host must be an IP literal here: {0}")]
	NotIpLiteral(String),
}

/// Parsed `quic://host:port`. IPv6 hosts keep their brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}
		let rest = s
			.strip_prefix("quic://")
			.ok_or_else(|| EndpointError::Scheme(s.to_string()))?;
		if rest.contains(['/', '?', '#']) {
			return Err(EndpointError::Trailing(s.to_string()));
		}
		let Some((host, port)) = rest.rsplit_once(':') else {
			return Err(EndpointError::Port(s.to_string()));
		};

		let host = host.trim();
		if host.is_empty() || host == "[]" {
			return Err(EndpointError::Host(s.to_string()));
		}
		let bracketed = host.starts_with('[') && host.ends_with(']');
		if host.contains(':') && !bracketed {
			return Err(EndpointError::UnbracketedIpv6(s.to_string()));
		}

		let port = port
			.trim()
			.parse::<u16>()
			.ok()
			.filter(|p| *p != 0)
			.ok_or_else(|| EndpointError::Port(s.to_string()))?;

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}

	/// Host without IPv6 brackets, suitable for TLS server names.
	pub fn server_name(&self) -> &str {
		self.host.trim_start_matches('[').trim_end_matches(']')
	}

	pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
		self.to_string()
			.trim_start_matches("quic://")
			.parse()
			.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
	}
}

impl fmt::Display for QuicEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "quic://{}:{}", self.host, self.port)
	}
}

impl FromStr for QuicEndpoint {
	type Err = EndpointError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_dns_ipv4_and_bracketed_ipv6() {
		let dns = QuicEndpoint::parse("quic://chat.example.org:443").unwrap();
		assert_eq!((dns.host.as_str(), dns.port), ("chat.example.org", 443));
		assert!(matches!(dns.socket_addr(), Err(EndpointError::NotIpLiteral(_))));

		let v4: QuicEndpoint = " quic://127.0.0.1:18300 ".parse().unwrap();
		assert_eq!(v4.socket_addr().unwrap().to_string(), "127.0.0.1:18300");

		let v6 = QuicEndpoint::parse("quic://[::1]:18300").unwrap();
		assert_eq!(v6.server_name(), "::1");
		assert_eq!(v6.to_string(), "quic://[::1]:18300");
		assert_eq!(v6.socket_addr().unwrap().to_string(), "[::1]:18300");
	}

	#[test]
	fn rejects_malformed_endpoints() {
		assert_eq!(QuicEndpoint::parse("  "), Err(EndpointError::Empty));
		assert!(matches!(QuicEndpoint::parse("https://a:1"), Err(EndpointError::Scheme(_))));
		assert!(matches!(QuicEndpoint::parse("quic://a:1/x"), Err(EndpointError::Trailing(_))));
		assert!(matches!(QuicEndpoint::parse("quic://::1:1"), Err(EndpointError::UnbracketedIpv6(_))));
		assert!(matches!(QuicEndpoint::parse("quic://a:0"), Err(EndpointError::Port(_))));
		assert!(matches!(QuicEndpoint::parse("quic://a"), Err(EndpointError::Port(_))));
		assert!(matches!(QuicEndpoint::parse("quic://:5"), Err(EndpointError::Host(_))));
	}
}
