//! Wire types shared by the platform and runner sides of the supervisor
//! protocol.

use std::collections::HashMap;

use flywheel_types::{
	AttemptCompletion, AttemptStatus, CompletedWaitpoint, EnvironmentType, ExecutionSnapshot, Run,
};
use flywheel_util::Id;
use serde::{Deserialize, Serialize};

/// What a warm-start long-poll hands to a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeuedMessage {
	pub run_id: Id,
	pub friendly_id: String,
	pub snapshot_id: Id,
	pub task_identifier: String,
	pub payload: String,
	pub payload_type: String,
	pub attempt_count: u32,
	pub max_attempts: u32,
	pub environment_id: Id,
	pub environment_type: EnvironmentType,
	pub trace_context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartAttemptRequest {
	#[serde(default)]
	pub is_warm_start: bool,
	/// Consecutive runs this runner has warm-started, for diagnostics.
	#[serde(default)]
	pub warm_start_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAttemptResponse {
	pub run: Run,
	pub snapshot: ExecutionSnapshot,
	pub attempt_number: u32,
	pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAttemptRequest {
	pub completion: AttemptCompletion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteAttemptResponse {
	pub attempt_status: AttemptStatus,
	pub snapshot: ExecutionSnapshot,
	/// Set when `attempt_status` is `RetryImmediately`.
	pub retry_delay_ms: Option<i64>,
}

/// Latest state of a run as seen by the snapshot poll, the notify channel's
/// follow-up fetch, and the continue endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunExecutionData {
	pub run: Run,
	pub snapshot: ExecutionSnapshot,
	pub completed_waitpoints: Vec<CompletedWaitpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendResponse {
	/// False when the platform declined the suspension; the runner stays
	/// alive and keeps executing.
	pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForDurationRequest {
	/// Absolute wake time in ms since epoch.
	pub date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForDurationResponse {
	pub waitpoint_id: Id,
	pub snapshot: ExecutionSnapshot,
}

/// Messages a runner sends on the `/workload` socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkloadClientMessage {
	#[serde(rename = "run:subscribe")]
	Subscribe { run_id: Id },
	#[serde(rename = "run:unsubscribe")]
	Unsubscribe { run_id: Id },
}

/// Messages the platform pushes on the `/workload` socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkloadServerMessage {
	/// The run's snapshot changed externally; the runner should fetch the
	/// latest execution data and react.
	#[serde(rename = "run:notify")]
	Notify { run_id: Id },
}
