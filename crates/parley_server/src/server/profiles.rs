#![forbid(unsafe_code)]

use dashmap::DashMap;
use parley_domain::{UserId, UserProfile};

use crate::server::auth::Identity;

/// Cache of profile data learned from verified credentials.
///
/// The profile store itself lives outside this process; entries here are
/// refreshed on every successful connect.
#[derive(Debug, Default)]
pub struct ProfileDirectory {
	profiles: DashMap<UserId, UserProfile>,
}

impl ProfileDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn upsert(&self, profile: UserProfile) {
		self.profiles.insert(profile.id.clone(), profile);
	}

	/// Merge what the identity provider told us about a user.
	pub fn remember(&self, identity: &Identity) {
		let mut entry = self
			.profiles
			.entry(identity.user_id.clone())
			.or_insert_with(|| UserProfile::placeholder(identity.user_id.clone()));
		if let Some(name) = identity.display_name.as_ref() {
			entry.display_name = name.clone();
		}
		if let Some(avatar) = identity.avatar_ref.as_ref() {
			entry.avatar_ref = avatar.clone();
		}
	}

	/// Known profile or a placeholder that uses the id as display name.
	pub fn get(&self, user: &UserId) -> UserProfile {
		self.profiles
			.get(user)
			.map(|p| p.value().clone())
			.unwrap_or_else(|| UserProfile::placeholder(user.clone()))
	}
}
