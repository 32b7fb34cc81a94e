use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Engine {
	/// Distributed run-lock lease duration.
	///
	/// Unit is in milliseconds.
	pub lock_lease: Option<i64>,
	/// Remaining lease below which the lock holder extends its lease.
	///
	/// Unit is in milliseconds.
	pub lock_extend_threshold: Option<i64>,
	/// Lock acquisition attempts before giving up.
	pub lock_retries: Option<usize>,
	/// Base interval between lock acquisition attempts; jitter of the same
	/// magnitude is added.
	///
	/// Unit is in milliseconds.
	pub lock_retry_interval: Option<i64>,
	/// Retry delays below this threshold tell the runner to retry in place
	/// instead of going back through the queue.
	///
	/// Unit is in milliseconds.
	pub retry_immediately_threshold: Option<i64>,
	/// Stall-check delay for snapshots without a live worker (created,
	/// queued, blocked, dequeued, finished).
	///
	/// Unit is in milliseconds.
	pub stall_check_idle: Option<i64>,
	/// Stall-check delay for snapshots with a live worker attached.
	///
	/// Unit is in milliseconds.
	pub stall_check_executing: Option<i64>,
	/// How often the lost-wakeup scanner pages through stale
	/// waiting-to-resume runs.
	///
	/// Unit is in milliseconds.
	pub resume_scan_interval: Option<i64>,
	/// Age after which a waiting-to-resume run is considered stale.
	///
	/// Unit is in milliseconds.
	pub resume_stale_threshold: Option<i64>,
	/// Default maximum attempts for runs that do not declare one.
	pub default_max_attempts: Option<u32>,
}

impl Engine {
	pub fn lock_lease_ms(&self) -> i64 {
		self.lock_lease.unwrap_or(5_000)
	}

	pub fn lock_extend_threshold_ms(&self) -> i64 {
		self.lock_extend_threshold.unwrap_or(500)
	}

	pub fn lock_retries(&self) -> usize {
		self.lock_retries.unwrap_or(10)
	}

	pub fn lock_retry_interval_ms(&self) -> i64 {
		self.lock_retry_interval.unwrap_or(200)
	}

	pub fn retry_immediately_threshold_ms(&self) -> i64 {
		self.retry_immediately_threshold.unwrap_or(5_000)
	}

	pub fn stall_check_idle_ms(&self) -> i64 {
		self.stall_check_idle.unwrap_or(60_000)
	}

	pub fn stall_check_executing_ms(&self) -> i64 {
		self.stall_check_executing.unwrap_or(15 * 60 * 1000)
	}

	pub fn resume_scan_interval_ms(&self) -> i64 {
		self.resume_scan_interval.unwrap_or(60_000)
	}

	pub fn resume_stale_threshold_ms(&self) -> i64 {
		self.resume_stale_threshold.unwrap_or(5 * 60 * 1000)
	}

	pub fn default_max_attempts(&self) -> u32 {
		self.default_max_attempts.unwrap_or(1)
	}
}
