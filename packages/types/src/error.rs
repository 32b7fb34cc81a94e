use flywheel_util::Id;
use serde::{Deserialize, Serialize};

/// Structured error retained on a terminally-failed run and surfaced to the
/// user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
	pub kind: RunErrorKind,
	pub code: Option<String>,
	pub message: String,
	pub stack_trace: Option<String>,
}

impl RunError {
	pub fn internal(code: InternalErrorCode, message: impl Into<String>) -> Self {
		RunError {
			kind: RunErrorKind::Internal,
			code: Some(code.to_string()),
			message: message.into(),
			stack_trace: None,
		}
	}

	pub fn user(message: impl Into<String>) -> Self {
		RunError {
			kind: RunErrorKind::User,
			code: None,
			message: message.into(),
			stack_trace: None,
		}
	}

	pub fn aborted(message: impl Into<String>) -> Self {
		RunError {
			kind: RunErrorKind::Aborted,
			code: None,
			message: message.into(),
			stack_trace: None,
		}
	}

	pub fn expired() -> Self {
		RunError {
			kind: RunErrorKind::Expired,
			code: None,
			message: "Run expired because the TTL elapsed before it was dequeued".to_string(),
			stack_trace: None,
		}
	}
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
pub enum RunErrorKind {
	/// The engine failed the run; terminal via system failure.
	Internal,
	/// User code raised.
	User,
	/// Canceled by an external actor.
	Aborted,
	Expired,
}

/// Codes carried by internal errors that trigger the system-failure path.
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
pub enum InternalErrorCode {
	TaskHasNoExecutionSnapshot,
	TaskDequeuedInvalidState,
	TaskRunStalled,
	TaskRunHeartbeatTimeout,
	TaskInputError,
	HandleErrorError,
}

/// Engine operation failures that callers must branch on. HTTP mapping lives
/// at the API layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
	#[error("run {0} not found")]
	RunNotFound(Id),

	#[error("waitpoint {0} not found")]
	WaitpointNotFound(Id),

	#[error("snapshot mismatch for run {run_id}: latest is {latest}, request had {provided}")]
	SnapshotMismatch { run_id: Id, latest: Id, provided: Id },

	#[error("run {0} has no execution snapshot")]
	NoSnapshot(Id),

	#[error("could not acquire lock on run {0}")]
	LockTimeout(Id),

	#[error("run {run_id} is {state}, cannot {operation}")]
	InvalidState {
		run_id: Id,
		operation: &'static str,
		state: String,
	},

	#[error("organization is out of entitlement")]
	OutOfEntitlement,

	#[error("invalid input: {0}")]
	Validation(String),

	#[error("internal run error {code}: {message}")]
	Internal {
		code: InternalErrorCode,
		message: String,
	},
}

impl EngineError {
	/// Whether the caller can safely retry the same request.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			EngineError::SnapshotMismatch { .. } | EngineError::LockTimeout(_)
		)
	}
}
