use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Queue {
	/// Key namespace prefix in the shared KV store.
	pub prefix: Option<String>,
	/// Maximum environments considered per dequeue pass.
	pub env_candidate_sample_size: Option<usize>,
	/// Maximum queues considered per environment per dequeue pass.
	pub queue_candidate_sample_size: Option<usize>,
	/// Concurrency limit applied to environments that have not declared one.
	pub default_env_concurrency_limit: Option<u32>,
	/// How long recent-selection weights persist before decaying.
	///
	/// Unit is in milliseconds.
	pub selection_decay_interval: Option<i64>,
}

impl Queue {
	pub fn prefix(&self) -> String {
		self.prefix.clone().unwrap_or_else(|| "engine:".to_string())
	}

	pub fn env_candidate_sample_size(&self) -> usize {
		self.env_candidate_sample_size.unwrap_or(12)
	}

	pub fn queue_candidate_sample_size(&self) -> usize {
		self.queue_candidate_sample_size.unwrap_or(36)
	}

	pub fn default_env_concurrency_limit(&self) -> u32 {
		self.default_env_concurrency_limit.unwrap_or(100)
	}

	pub fn selection_decay_interval(&self) -> i64 {
		self.selection_decay_interval.unwrap_or(30_000)
	}
}
