use flywheel_util::Id;
use serde::{Deserialize, Serialize};

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
pub enum WaitpointKind {
	/// Completed when the associated run reaches a terminal status.
	Run,
	/// Completed by the delayed-job worker at `completed_after`.
	DateTime,
	/// Completed by an explicit external call.
	Manual,
}

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
pub enum WaitpointStatus {
	Pending,
	Completed,
}

/// A completion token a run can block on. Completed is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waitpoint {
	pub id: Id,
	pub project_id: Id,
	pub kind: WaitpointKind,
	pub status: WaitpointStatus,
	pub completed_after: Option<i64>,
	pub completed_by_run_id: Option<Id>,
	pub idempotency_key: Option<String>,
	pub output: Option<String>,
	pub output_is_error: bool,
	pub created_at: i64,
	pub completed_at: Option<i64>,
}

/// Waitpoint completion delivered to a blocked run when it resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedWaitpoint {
	pub id: Id,
	pub kind: WaitpointKind,
	pub completed_by_run_id: Option<Id>,
	pub output: Option<String>,
	pub output_is_error: bool,
	pub completed_at: i64,
}

impl CompletedWaitpoint {
	pub fn from_waitpoint(w: &Waitpoint) -> Self {
		CompletedWaitpoint {
			id: w.id,
			kind: w.kind,
			completed_by_run_id: w.completed_by_run_id,
			output: w.output.clone(),
			output_is_error: w.output_is_error,
			completed_at: w.completed_at.unwrap_or_default(),
		}
	}
}
