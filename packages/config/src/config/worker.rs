use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Worker {
	/// How often the delayed-job worker polls for due jobs.
	///
	/// Unit is in milliseconds.
	pub poll_interval: Option<i64>,
	/// How long a pulled job stays invisible before it can be reclaimed.
	///
	/// Unit is in milliseconds.
	pub visibility_timeout: Option<i64>,
	/// Maximum jobs pulled per poll.
	pub batch_size: Option<usize>,
	/// Base delay before a failed job is retried; doubles per attempt.
	///
	/// Unit is in milliseconds.
	pub retry_base_delay: Option<i64>,
}

impl Worker {
	pub fn poll_interval_ms(&self) -> i64 {
		self.poll_interval.unwrap_or(1_000)
	}

	pub fn visibility_timeout_ms(&self) -> i64 {
		self.visibility_timeout.unwrap_or(5_000)
	}

	pub fn batch_size(&self) -> usize {
		self.batch_size.unwrap_or(100)
	}

	pub fn retry_base_delay_ms(&self) -> i64 {
		self.retry_base_delay.unwrap_or(1_000)
	}
}
