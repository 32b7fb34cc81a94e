use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flywheel_types::EngineError;
use flywheel_util::Id;
use rand::Rng;

pub mod memory;
pub mod redis;

pub type LockDriverHandle = Arc<dyn LockDriver>;

/// Lease-based mutual exclusion in the shared KV store.
#[async_trait]
pub trait LockDriver: Send + Sync {
	async fn try_acquire(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool>;

	/// Extends the lease iff still held by `owner`.
	async fn extend(&self, key: &str, owner: &str, ttl_ms: i64) -> Result<bool>;

	/// Releases iff still held by `owner`.
	async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

/// Serialises engine state-machine steps per run. No two engine processes
/// may interleave snapshot/waitpoint/queue mutations for the same run.
#[derive(Clone)]
pub struct LockManager {
	driver: LockDriverHandle,
	config: flywheel_config::Config,
}

impl LockManager {
	pub fn new(config: flywheel_config::Config, driver: LockDriverHandle) -> Self {
		LockManager { driver, config }
	}

	/// Runs `f` under the run's lock. The lease auto-extends while `f` is
	/// still executing; acquisition retries with jitter before giving up
	/// with a retryable error.
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn with_run_lock<T, F, Fut>(&self, run_id: Id, f: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let engine_config = self.config.engine();
		let key = format!("lock:run:{run_id}");
		let owner = Id::new().to_string();
		let lease_ms = engine_config.lock_lease_ms();

		let mut acquired = false;
		for _ in 0..engine_config.lock_retries() {
			if self.driver.try_acquire(&key, &owner, lease_ms).await? {
				acquired = true;
				break;
			}
			let jitter = rand::thread_rng()
				.gen_range(0..=engine_config.lock_retry_interval_ms());
			tokio::time::sleep(Duration::from_millis(
				(engine_config.lock_retry_interval_ms() + jitter) as u64,
			))
			.await;
		}
		if !acquired {
			return Err(EngineError::LockTimeout(run_id).into());
		}

		// Extend the lease in the background until the step finishes. The
		// extension cadence leaves the configured threshold of slack.
		let extender = {
			let driver = self.driver.clone();
			let key = key.clone();
			let owner = owner.clone();
			let interval_ms =
				(lease_ms - engine_config.lock_extend_threshold_ms()).max(100) as u64;
			tokio::spawn(async move {
				loop {
					tokio::time::sleep(Duration::from_millis(interval_ms)).await;
					match driver.extend(&key, &owner, lease_ms).await {
						Ok(true) => {}
						Ok(false) => {
							tracing::warn!(%key, "lost run lock while extending");
							break;
						}
						Err(err) => {
							tracing::warn!(?err, %key, "failed extending run lock");
							break;
						}
					}
				}
			})
		};

		let result = f().await;

		extender.abort();
		if let Err(err) = self.driver.release(&key, &owner).await {
			tracing::warn!(?err, %key, "failed releasing run lock");
		}

		result
	}
}

#[cfg(test)]
mod tests {
	use super::memory::MemoryLockDriver;
	use super::*;

	fn test_locks() -> LockManager {
		LockManager::new(
			flywheel_config::Config::from_root(Default::default()),
			Arc::new(MemoryLockDriver::new()),
		)
	}

	#[tokio::test]
	async fn lock_is_exclusive_while_held() {
		let locks = test_locks();
		let run_id = Id::new();

		let driver = locks.driver.clone();
		let key = format!("lock:run:{run_id}");

		locks
			.with_run_lock(run_id, || async {
				// A second owner cannot acquire while the step runs.
				assert!(!driver.try_acquire(&key, "other", 5_000).await?);
				Ok(())
			})
			.await
			.unwrap();

		// Released afterwards.
		assert!(driver.try_acquire(&key, "other", 5_000).await.unwrap());
	}

	#[tokio::test]
	async fn expired_lease_can_be_taken_over() {
		let locks = test_locks();
		let key = "lock:run:x";

		assert!(locks.driver.try_acquire(key, "a", 1).await.unwrap());
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(locks.driver.try_acquire(key, "b", 5_000).await.unwrap());

		// The stale owner cannot release the new lease.
		locks.driver.release(key, "a").await.unwrap();
		assert!(!locks.driver.try_acquire(key, "c", 5_000).await.unwrap());
	}
}
