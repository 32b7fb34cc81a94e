use anyhow::{Context, Result};
use async_trait::async_trait;
use indoc::indoc;

use crate::lock::LockDriver;

const EXTEND_SCRIPT: &str = indoc! {"
	if redis.call('GET', KEYS[1]) == ARGV[1] then
		return redis.call('PEXPIRE', KEYS[1], ARGV[2])
	end
	return 0
"};

const RELEASE_SCRIPT: &str = indoc! {"
	if redis.call('GET', KEYS[1]) == ARGV[1] then
		return redis.call('DEL', KEYS[1])
	end
	return 0
"};

/// SET NX PX lock with owner-checked extend/release.
pub struct RedisLockDriver {
	pool: flywheel_pools::RedisPool,
	prefix: String,
}

impl RedisLockDriver {
	pub fn new(pool: flywheel_pools::RedisPool, prefix: impl Into<String>) -> Self {
		RedisLockDriver {
			pool,
			prefix: prefix.into(),
		}
	}

	fn key(&self, key: &str) -> String {
		format!("{}{}", self.prefix, key)
	}
}

#[async_trait]
impl LockDriver for RedisLockDriver {
	async fn try_acquire(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool> {
		let mut conn = self.pool.clone();
		let reply: Option<String> = redis::cmd("SET")
			.arg(self.key(key))
			.arg(owner)
			.arg("NX")
			.arg("PX")
			.arg(ttl_ms)
			.query_async(&mut conn)
			.await
			.context("lock acquire failed")?;
		Ok(reply.is_some())
	}

	async fn extend(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool> {
		let mut conn = self.pool.clone();
		let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
			.key(self.key(key))
			.arg(owner)
			.arg(ttl_ms)
			.invoke_async(&mut conn)
			.await
			.context("lock extend failed")?;
		Ok(extended == 1)
	}

	async fn release(&self, key: &str, owner: &str) -> Result<()> {
		let mut conn = self.pool.clone();
		let _: i64 = redis::Script::new(RELEASE_SCRIPT)
			.key(self.key(key))
			.arg(owner)
			.invoke_async(&mut conn)
			.await
			.context("lock release failed")?;
		Ok(())
	}
}
