use flywheel_util::Id;
use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Result a runner submits when an attempt finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptCompletion {
	pub ok: bool,
	pub output: Option<String>,
	pub error: Option<RunError>,
	pub retry: Option<RetryOptions>,
}

impl AttemptCompletion {
	pub fn success(output: impl Into<String>) -> Self {
		AttemptCompletion {
			ok: true,
			output: Some(output.into()),
			error: None,
			retry: None,
		}
	}

	pub fn failure(error: RunError, retry: Option<RetryOptions>) -> Self {
		AttemptCompletion {
			ok: false,
			output: None,
			error: Some(error),
			retry,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryOptions {
	pub delay_ms: i64,
}

/// What the platform decided to do with a submitted completion.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
	RunFinished,
	RunPendingCancel,
	/// Re-enqueued; the runner should return to warm start.
	RetryQueued,
	/// The runner should sleep for the retry delay and start a new attempt.
	RetryImmediately,
}

/// One execution try of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
	pub id: Id,
	pub run_id: Id,
	pub number: u32,
	pub worker_id: Option<String>,
	pub started_at: i64,
	pub completed_at: Option<i64>,
	pub error: Option<RunError>,
}
