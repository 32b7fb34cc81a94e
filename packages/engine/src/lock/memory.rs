use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::lock::LockDriver;

/// In-process lock table for tests and local development.
#[derive(Default)]
pub struct MemoryLockDriver {
	/// key → (owner, lease deadline ms).
	leases: Mutex<HashMap<String, (String, i64)>>,
}

impl MemoryLockDriver {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl LockDriver for MemoryLockDriver {
	async fn try_acquire(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool> {
		let mut leases = self.leases.lock().unwrap();
		let now = flywheel_util::timestamp::now();

		match leases.get(key) {
			Some((holder, deadline)) if *deadline > now && holder != owner => Ok(false),
			_ => {
				leases.insert(key.to_string(), (owner.to_string(), now + ttl_ms));
				Ok(true)
			}
		}
	}

	async fn extend(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool> {
		let mut leases = self.leases.lock().unwrap();
		let now = flywheel_util::timestamp::now();

		match leases.get_mut(key) {
			Some((holder, deadline)) if holder == owner && *deadline > now => {
				*deadline = now + ttl_ms;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn release(&self, key: &str, owner: &str) -> Result<()> {
		let mut leases = self.leases.lock().unwrap();
		if let Some((holder, _)) = leases.get(key) {
			if holder == owner {
				leases.remove(key);
			}
		}
		Ok(())
	}
}
