use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Api {
	pub host: Option<String>,
	pub port: Option<u16>,
	/// Bearer token required on the public routes. Absent disables auth
	/// (local development only).
	pub auth_token: Option<String>,
	/// Bearer token required on the runner-scoped routes.
	pub runner_token: Option<String>,
	/// How often a blocked warm-start long-poll rechecks the queue.
	///
	/// Unit is in milliseconds.
	pub warm_start_poll_interval: Option<i64>,
	/// Maximum time a warm-start long-poll holds the connection open.
	///
	/// Unit is in milliseconds.
	pub warm_start_max_wait: Option<i64>,
}

impl Api {
	pub fn host(&self) -> String {
		self.host.clone().unwrap_or_else(|| "127.0.0.1".to_string())
	}

	pub fn port(&self) -> u16 {
		self.port.unwrap_or(8030)
	}

	pub fn warm_start_poll_interval_ms(&self) -> i64 {
		self.warm_start_poll_interval.unwrap_or(500)
	}

	pub fn warm_start_max_wait_ms(&self) -> i64 {
		self.warm_start_max_wait.unwrap_or(20_000)
	}
}
