use flywheel_util::Id;
use serde::{Deserialize, Serialize};

use crate::error::RunError;
use crate::queue::EnvironmentType;

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
	/// Waiting in a queue to be dequeued.
	Pending,
	/// Blocked on a datetime waitpoint created from `delay_until`.
	Delayed,
	/// A runner is actively working on an attempt.
	Executing,
	/// Blocked on one or more waitpoints.
	WaitingToResume,
	CompletedSuccessfully,
	CompletedWithErrors,
	/// The engine itself failed the run. Terminal.
	SystemFailure,
	/// The runner disappeared and no retries remain. Terminal.
	Crashed,
	/// TTL elapsed before the run was dequeued. Terminal.
	Expired,
	Canceled,
}

impl RunStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			RunStatus::CompletedSuccessfully
				| RunStatus::CompletedWithErrors
				| RunStatus::SystemFailure
				| RunStatus::Crashed
				| RunStatus::Expired
				| RunStatus::Canceled
		)
	}
}

/// A single invocation of a task with a given payload. Mutated only by the
/// run engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
	pub id: Id,
	pub friendly_id: String,
	pub status: RunStatus,

	pub task_identifier: String,
	pub payload: String,
	pub payload_type: String,

	pub organization_id: Id,
	pub project_id: Id,
	pub environment_id: Id,
	pub environment_type: EnvironmentType,

	pub queue_name: String,
	pub master_queue: String,
	pub concurrency_key: Option<String>,
	pub idempotency_key: Option<String>,

	pub max_attempts: u32,
	pub attempt_count: u32,
	/// Negative offsets sort earlier within the queue.
	pub priority_ms: i64,
	pub ttl_ms: Option<i64>,
	pub delay_until: Option<i64>,
	pub tags: Vec<String>,

	pub parent_run_id: Option<Id>,
	pub parent_attempt_id: Option<Id>,
	pub root_run_id: Option<Id>,
	pub batch_id: Option<Id>,
	pub depth: u32,
	pub resume_parent_on_completion: bool,

	/// Waitpoint completed when this run reaches a terminal status.
	pub associated_waitpoint_id: Option<Id>,

	pub trace_context: Option<serde_json::Value>,

	pub output: Option<String>,
	pub error: Option<RunError>,

	pub created_at: i64,
	pub updated_at: i64,
}
