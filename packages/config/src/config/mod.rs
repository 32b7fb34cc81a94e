use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod api;
pub mod db;
pub mod engine;
pub mod queue;
pub mod worker;

pub use api::Api;
pub use db::{Postgres, Redis};
pub use engine::Engine;
pub use queue::Queue;
pub use worker::Worker;

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Root {
	pub queue: Option<Queue>,
	pub engine: Option<Engine>,
	pub worker: Option<Worker>,
	pub api: Option<Api>,
	/// When absent, the queue, timer, and lock stores run on the in-process
	/// memory drivers.
	pub redis: Option<Redis>,
	/// When absent, the relational store runs on the in-process memory driver.
	pub postgres: Option<Postgres>,
}

impl Root {
	pub fn queue(&self) -> Queue {
		self.queue.clone().unwrap_or_default()
	}

	pub fn engine(&self) -> Engine {
		self.engine.clone().unwrap_or_default()
	}

	pub fn worker(&self) -> Worker {
		self.worker.clone().unwrap_or_default()
	}

	pub fn api(&self) -> Api {
		self.api.clone().unwrap_or_default()
	}
}
