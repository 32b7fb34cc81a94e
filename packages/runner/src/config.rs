/// Static configuration for a runner process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
	pub endpoint: String,
	pub runner_token: Option<String>,
	pub runner_id: String,
	pub master_queue: String,
	/// Overall lifetime of the warm-start loop; the runner exits when it
	/// elapses with no work.
	pub total_duration_ms: i64,
	pub heartbeat_interval_ms: i64,
	pub snapshot_poll_interval_ms: i64,
	/// Whether to ask the platform for suspension when blocked on
	/// waitpoints.
	pub suspend_on_wait: bool,
	/// Connect the `/workload` socket for push notifications. The snapshot
	/// poll still runs as the fallback.
	pub use_notify_socket: bool,
}

impl RunnerConfig {
	pub fn builder(endpoint: impl Into<String>) -> RunnerConfigBuilder {
		RunnerConfigBuilder {
			config: RunnerConfig {
				endpoint: endpoint.into(),
				runner_token: None,
				runner_id: flywheel_util::id::friendly_id("runner", flywheel_util::Id::new()),
				master_queue: "sharedQueue".to_string(),
				total_duration_ms: 60_000,
				heartbeat_interval_ms: 30_000,
				snapshot_poll_interval_ms: 5_000,
				suspend_on_wait: false,
				use_notify_socket: false,
			},
		}
	}
}

pub struct RunnerConfigBuilder {
	config: RunnerConfig,
}

impl RunnerConfigBuilder {
	pub fn runner_token(mut self, token: impl Into<String>) -> Self {
		self.config.runner_token = Some(token.into());
		self
	}

	pub fn runner_id(mut self, runner_id: impl Into<String>) -> Self {
		self.config.runner_id = runner_id.into();
		self
	}

	pub fn master_queue(mut self, master_queue: impl Into<String>) -> Self {
		self.config.master_queue = master_queue.into();
		self
	}

	pub fn total_duration_ms(mut self, total_duration_ms: i64) -> Self {
		self.config.total_duration_ms = total_duration_ms;
		self
	}

	pub fn heartbeat_interval_ms(mut self, heartbeat_interval_ms: i64) -> Self {
		self.config.heartbeat_interval_ms = heartbeat_interval_ms;
		self
	}

	pub fn snapshot_poll_interval_ms(mut self, snapshot_poll_interval_ms: i64) -> Self {
		self.config.snapshot_poll_interval_ms = snapshot_poll_interval_ms;
		self
	}

	pub fn suspend_on_wait(mut self, suspend_on_wait: bool) -> Self {
		self.config.suspend_on_wait = suspend_on_wait;
		self
	}

	pub fn use_notify_socket(mut self, use_notify_socket: bool) -> Self {
		self.config.use_notify_socket = use_notify_socket;
		self
	}

	pub fn build(self) -> RunnerConfig {
		self.config
	}
}
