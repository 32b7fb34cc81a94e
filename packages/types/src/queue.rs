use std::collections::HashMap;

use flywheel_util::Id;
use serde::{Deserialize, Serialize};

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
pub enum EnvironmentType {
	Production,
	Staging,
	Development,
	Preview,
}

impl EnvironmentType {
	/// Development environments get their own isolated shared queue so local
	/// supervisors never steal deployed work.
	pub fn uses_isolated_master_queue(&self) -> bool {
		matches!(self, EnvironmentType::Development)
	}
}

/// The slice of an environment the queue and engine need to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
	pub id: Id,
	pub organization_id: Id,
	pub project_id: Id,
	pub env_type: EnvironmentType,
	/// Maximum concurrent runs across all queues in this environment.
	pub concurrency_limit: u32,
	pub env_vars: HashMap<String, String>,
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
pub enum TaskQueueKind {
	/// Declared explicitly in task code.
	Named,
	/// Created implicitly for a task identifier.
	Virtual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueue {
	pub environment_id: Id,
	pub name: String,
	/// `None` inherits the environment limit.
	pub concurrency_limit: Option<u32>,
	/// Declared dequeues-per-second ceiling. Enforcement lives at the edge.
	pub rate_limit: Option<u32>,
	pub kind: TaskQueueKind,
}

/// Queue element. The queue's sorted sets hold only ids; the body lives
/// under its own key so blocking a run does not lose the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
	pub run_id: Id,
	pub task_identifier: String,
	pub organization_id: Id,
	pub project_id: Id,
	pub environment_id: Id,
	pub environment_type: EnvironmentType,
	pub queue_name: String,
	pub concurrency_key: Option<String>,
	pub enqueued_at: i64,
	pub attempt_count: u32,
}
