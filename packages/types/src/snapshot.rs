use flywheel_util::Id;
use serde::{Deserialize, Serialize};

use crate::run::RunStatus;

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
pub enum ExecutionStatus {
	RunCreated,
	Queued,
	DequeuedForExecution,
	/// Unblocked while suspended; the runner must call continue to resume.
	PendingExecuting,
	Executing,
	/// Executing and blocked on waitpoints; the runner may request suspension.
	ExecutingWithWaitpoints,
	BlockedByWaitpoints,
	PendingCancel,
	Suspended,
	Finished,
}

impl ExecutionStatus {
	/// Whether a runner currently holds (or is about to hold) the attempt.
	pub fn has_live_worker(&self) -> bool {
		matches!(
			self,
			ExecutionStatus::Executing
				| ExecutionStatus::ExecutingWithWaitpoints
				| ExecutionStatus::PendingExecuting
				| ExecutionStatus::PendingCancel
				| ExecutionStatus::Suspended
		)
	}
}

/// Immutable record of a run's execution status at a point in time. The
/// latest snapshot is the only authoritative one; older snapshots are audit
/// history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
	pub id: Id,
	pub run_id: Id,
	pub execution_status: ExecutionStatus,
	pub run_status: RunStatus,
	pub description: String,
	pub worker_id: Option<String>,
	pub attempt_number: u32,
	/// Waitpoints whose completions should be delivered to the runner when it
	/// observes this snapshot.
	pub completed_waitpoint_ids: Vec<Id>,
	pub created_at: i64,
}
