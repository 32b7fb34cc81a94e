#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use conveyor::{MemoryDriver, RunQueue};
use flywheel_engine::db::memory::MemoryDatabase;
use flywheel_engine::entitlement::DenyList;
use flywheel_engine::lock::memory::MemoryLockDriver;
use flywheel_engine::{AllowAll, Engine, EntitlementChecker, LockManager, TriggerRequest};
use flywheel_types::{Environment, EnvironmentType};
use flywheel_util::Id;
use ratchet::{Registry, TimerDriverHandle, Worker};

/// Everything wired on memory drivers, the way a single engine process runs
/// in tests.
pub struct TestCtx {
	pub engine: Engine,
	pub queue: RunQueue,
	pub timers: TimerDriverHandle,
	pub worker: Worker,
	pub env: Environment,
}

impl TestCtx {
	pub fn new() -> Self {
		Self::with_env_limit(100)
	}

	pub fn with_env_limit(concurrency_limit: u32) -> Self {
		Self::build(Default::default(), concurrency_limit, false)
	}

	pub fn with_root(root: flywheel_config::Root) -> Self {
		Self::build(root, 100, false)
	}

	/// Engine that rejects every trigger from the test organization.
	pub fn with_denied_org() -> Self {
		Self::build(Default::default(), 100, true)
	}

	fn build(root: flywheel_config::Root, concurrency_limit: u32, deny_org: bool) -> Self {
		let config = flywheel_config::Config::from_root(root);

		let env = Environment {
			id: Id::new(),
			organization_id: Id::new(),
			project_id: Id::new(),
			env_type: EnvironmentType::Production,
			concurrency_limit,
			env_vars: HashMap::from([("API_URL".to_string(), "http://localhost".to_string())]),
		};

		let entitlements: Arc<dyn EntitlementChecker> = if deny_org {
			Arc::new(DenyList {
				organizations: vec![env.organization_id],
			})
		} else {
			Arc::new(AllowAll)
		};

		let queue = RunQueue::new(config.clone(), Arc::new(MemoryDriver::new()));
		let timers: TimerDriverHandle = Arc::new(ratchet::MemoryTimerDriver::new());
		let locks = LockManager::new(config.clone(), Arc::new(MemoryLockDriver::new()));
		let engine = Engine::new(
			config.clone(),
			Arc::new(MemoryDatabase::new()),
			queue.clone(),
			timers.clone(),
			locks,
			entitlements,
		);

		let mut registry = Registry::new();
		engine.register_job_handlers(&mut registry).unwrap();
		let worker = Worker::new(config, Arc::new(registry), timers.clone());

		TestCtx {
			engine,
			queue,
			timers,
			worker,
			env,
		}
	}

	pub fn master_queue(&self) -> String {
		self.queue.master_queue_name(&self.env)
	}

	pub fn trigger_request(&self, task: &str) -> TriggerRequest {
		TriggerRequest {
			task_identifier: task.to_string(),
			payload: "{}".to_string(),
			payload_type: "application/json".to_string(),
			environment: self.env.clone(),
			queue_name: None,
			queue_concurrency_limit: None,
			concurrency_key: None,
			idempotency_key: None,
			max_attempts: None,
			priority_ms: 0,
			ttl_ms: None,
			delay_until: None,
			tags: Vec::new(),
			parent_run_id: None,
			parent_attempt_id: None,
			batch_id: None,
			resume_parent_on_completion: false,
			trace_context: None,
		}
	}

	/// One delayed-job worker pass.
	pub async fn tick_timers(&self) -> usize {
		self.worker.tick().await.expect("timer tick failed")
	}
}
