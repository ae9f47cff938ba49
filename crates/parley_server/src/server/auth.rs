#![forbid(unsafe_code)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::UserId;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::secret::SecretString;
use crate::util::time::unix_secs_now;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("missing credential")]
	Missing,

	#[error("invalid credential: {0}")]
	Invalid(String),

	#[error("credential expired")]
	Expired,

	#[error("identity provider did not answer in time")]
	Timeout,

	#[error("identity provider unavailable: {0}")]
	Unavailable(String),
}

/// Verified identity resolved from a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub user_id: UserId,
	pub display_name: Option<String>,
	pub avatar_ref: Option<String>,
}

/// Validates credentials issued by the external identity service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	async fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
}

/// Stateless `v1.<payload>.<signature>` tokens signed with HMAC-SHA256.
#[derive(Debug, Clone)]
pub struct HmacIdentityProvider {
	secret: SecretString,
}

impl HmacIdentityProvider {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

#[async_trait]
impl IdentityProvider for HmacIdentityProvider {
	async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
		let credential = credential.trim();
		if credential.is_empty() {
			return Err(AuthError::Missing);
		}

		let claims = verify_hmac_token(credential, self.secret.expose())?;
		let user_id = UserId::new(claims.sub).map_err(|e| AuthError::Invalid(format!("subject: {e}")))?;

		Ok(Identity {
			user_id,
			display_name: claims.name.filter(|s| !s.trim().is_empty()),
			avatar_ref: claims.avatar.filter(|s| !s.trim().is_empty()),
		})
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let mut parts = token.split('.');
	let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(AuthError::Invalid("invalid token format".into()));
	};

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|e| AuthError::Invalid(format!("decode token payload: {e}")))?;
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|e| AuthError::Invalid(format!("decode token signature: {e}")))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Invalid("invalid token signature".into()));
	}

	let claims: AuthClaims =
		serde_json::from_slice(&payload).map_err(|e| AuthError::Invalid(format!("parse token claims: {e}")))?;
	if claims.exp <= unix_secs_now() {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Produce a token accepted by [`HmacIdentityProvider`].
pub fn sign_hmac_token(claims: &AuthClaims, secret: &str) -> Result<String, AuthError> {
	let payload = serde_json::to_vec(claims).map_err(|e| AuthError::Invalid(format!("encode claims: {e}")))?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| AuthError::Unavailable(format!("hmac key: {e}")))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn claims(sub: &str, exp: u64) -> AuthClaims {
		AuthClaims {
			sub: sub.to_string(),
			exp,
			name: Some("Alice".to_string()),
			avatar: None,
		}
	}

	#[tokio::test]
	async fn signed_token_resolves_identity() {
		let token = sign_hmac_token(&claims("alice", unix_secs_now() + 60), "s3cret").unwrap();
		let provider = HmacIdentityProvider::new(SecretString::new("s3cret"));

		let identity = provider.verify(&token).await.expect("valid token");
		assert_eq!(identity.user_id.as_str(), "alice");
		assert_eq!(identity.display_name.as_deref(), Some("Alice"));
		assert_eq!(identity.avatar_ref, None);
	}

	#[tokio::test]
	async fn wrong_secret_is_rejected() {
		let token = sign_hmac_token(&claims("alice", unix_secs_now() + 60), "s3cret").unwrap();
		let provider = HmacIdentityProvider::new(SecretString::new("other"));
		assert!(matches!(provider.verify(&token).await, Err(AuthError::Invalid(_))));
	}

	#[test]
	fn expired_token_is_rejected() {
		let token = sign_hmac_token(&claims("alice", 1), "s3cret").unwrap();
		assert_eq!(verify_hmac_token(&token, "s3cret"), Err(AuthError::Expired));
	}

	#[test]
	fn malformed_tokens_are_rejected() {
		for token in ["", "v1", "v1.a", "v2.a.b", "v1.a.b.c"] {
			assert!(verify_hmac_token(token, "s3cret").is_err(), "{token} should fail");
		}
	}

	#[tokio::test]
	async fn blank_credential_is_missing() {
		let provider = HmacIdentityProvider::new(SecretString::new("s3cret"));
		assert_eq!(provider.verify("  ").await, Err(AuthError::Missing));
	}
}
