use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::job::TimerJob;

pub mod memory;
pub mod redis;

pub type TimerDriverHandle = Arc<dyn TimerDriver>;

/// Storage backend for the timer queue. A single sorted set scored by
/// availability doubles as the pending queue and the in-flight ledger: a
/// pull bumps the score to `now + visibility_timeout`, so an unacked job
/// becomes due again on its own.
#[async_trait]
pub trait TimerDriver: Send + Sync {
	/// Inserts the job, replacing any existing job with the same id.
	async fn enqueue(&self, job: &TimerJob) -> Result<()>;

	/// Claims up to `limit` due jobs, making each invisible for
	/// `visibility_timeout_ms`.
	async fn pull(
		&self,
		now: i64,
		visibility_timeout_ms: i64,
		limit: usize,
	) -> Result<Vec<TimerJob>>;

	/// Removes the job permanently. Idempotent.
	async fn ack(&self, job_id: &str) -> Result<()>;

	/// Makes the job due again at `retry_at`.
	async fn nack(&self, job_id: &str, retry_at: i64) -> Result<()>;

	/// Drops a pending job if it exists. Idempotent.
	async fn cancel(&self, job_id: &str) -> Result<()>;

	async fn len(&self) -> Result<u64>;
}
