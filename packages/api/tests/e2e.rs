//! Full-stack protocol tests: a real runner talking HTTP to a real API
//! server, everything behind them on memory drivers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor::{MemoryDriver, RunQueue};
use flywheel_engine::db::memory::MemoryDatabase;
use flywheel_engine::lock::memory::MemoryLockDriver;
use flywheel_engine::{AllowAll, Engine, LockManager, TriggerRequest};
use flywheel_runner::{EchoExecutor, Runner, RunnerConfig, WaitForDurationExecutor};
use flywheel_types::{Environment, EnvironmentType, RunStatus};
use flywheel_util::Id;
use ratchet::{Registry, TimerDriverHandle};
use tokio::sync::watch;

struct TestPlatform {
	engine: Engine,
	env: Environment,
	endpoint: String,
	_shutdown: watch::Sender<()>,
}

async fn start_platform() -> TestPlatform {
	// Fast timers so waits and polls resolve within test time.
	let config = flywheel_config::Config::from_root(flywheel_config::Root {
		worker: Some(flywheel_config::Worker {
			poll_interval: Some(50),
			..Default::default()
		}),
		api: Some(flywheel_config::Api {
			warm_start_poll_interval: Some(50),
			warm_start_max_wait: Some(2_000),
			..Default::default()
		}),
		..Default::default()
	});

	let queue = RunQueue::new(config.clone(), Arc::new(MemoryDriver::new()));
	let timers: TimerDriverHandle = Arc::new(ratchet::MemoryTimerDriver::new());
	let locks = LockManager::new(config.clone(), Arc::new(MemoryLockDriver::new()));
	let engine = Engine::new(
		config.clone(),
		Arc::new(MemoryDatabase::new()),
		queue,
		timers.clone(),
		locks,
		Arc::new(AllowAll),
	);

	let mut registry = Registry::new();
	engine.register_job_handlers(&mut registry).unwrap();
	let worker = ratchet::Worker::new(config.clone(), Arc::new(registry), timers);

	let (shutdown_tx, shutdown_rx) = watch::channel(());
	tokio::spawn(worker.start(Some(shutdown_rx)));

	let router = flywheel_api::router(config, engine.clone()).await.unwrap();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, router).await.unwrap();
	});

	let env = Environment {
		id: Id::new(),
		organization_id: Id::new(),
		project_id: Id::new(),
		env_type: EnvironmentType::Production,
		concurrency_limit: 10,
		env_vars: HashMap::new(),
	};

	TestPlatform {
		engine,
		env,
		endpoint: format!("http://{addr}"),
		_shutdown: shutdown_tx,
	}
}

fn trigger_request(env: &Environment, task: &str, payload: &str) -> TriggerRequest {
	TriggerRequest {
		task_identifier: task.to_string(),
		payload: payload.to_string(),
		payload_type: "application/json".to_string(),
		environment: env.clone(),
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

async fn wait_for_status(engine: &Engine, run_id: Id, status: RunStatus, timeout_ms: u64) {
	let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
	loop {
		let run = engine.get_run(run_id).await.unwrap();
		if run.status == status {
			return;
		}
		assert!(
			tokio::time::Instant::now() < deadline,
			"run {run_id} stuck in {}, wanted {status}",
			run.status
		);
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_run_completes_over_http() {
	let platform = start_platform().await;

	let run = platform
		.engine
		.trigger(trigger_request(&platform.env, "echo", "{\"x\":1}"))
		.await
		.unwrap();

	let mut runner = Runner::new(
		RunnerConfig::builder(&platform.endpoint)
			.total_duration_ms(200)
			.snapshot_poll_interval_ms(100)
			.build(),
		Arc::new(EchoExecutor),
	)
	.unwrap();
	tokio::spawn(async move {
		let _ = runner.start().await;
	});

	wait_for_status(&platform.engine, run.id, RunStatus::CompletedSuccessfully, 5_000).await;
	let finished = platform.engine.get_run(run.id).await.unwrap();
	assert_eq!(finished.output.as_deref(), Some("{\"x\":1}"));
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_duration_round_trips_over_http() {
	let platform = start_platform().await;

	let run = platform
		.engine
		.trigger(trigger_request(&platform.env, "waiter", "{}"))
		.await
		.unwrap();

	let mut runner = Runner::new(
		RunnerConfig::builder(&platform.endpoint)
			.total_duration_ms(200)
			.snapshot_poll_interval_ms(100)
			.build(),
		Arc::new(WaitForDurationExecutor { wait_ms: 300 }),
	)
	.unwrap();
	tokio::spawn(async move {
		let _ = runner.start().await;
	});

	// The run blocks on the datetime waitpoint, resumes when the timer
	// fires, and completes.
	wait_for_status(&platform.engine, run.id, RunStatus::WaitingToResume, 5_000).await;
	wait_for_status(&platform.engine, run.id, RunStatus::CompletedSuccessfully, 5_000).await;
	let finished = platform.engine.get_run(run.id).await.unwrap();
	assert_eq!(finished.output.as_deref(), Some("\"woke\""));
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_and_read_through_the_public_api() {
	let platform = start_platform().await;
	let client = reqwest::Client::new();

	let response = client
		.post(format!("{}/trigger", platform.endpoint))
		.json(&serde_json::json!({
			"task_identifier": "api-task",
			"payload": "{}",
			"environment": platform.env,
			"tags": ["from-api"],
		}))
		.send()
		.await
		.unwrap();
	assert!(response.status().is_success());
	let body: serde_json::Value = response.json().await.unwrap();
	let run_id = body["run"]["id"].as_str().unwrap().to_string();

	let fetched: serde_json::Value = client
		.get(format!("{}/runs/{}", platform.endpoint, run_id))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(fetched["run"]["status"], "PENDING");
	assert_eq!(fetched["snapshot"]["execution_status"], "QUEUED");

	// Unknown runs are 404s.
	let missing = client
		.get(format!("{}/runs/{}", platform.endpoint, Id::new()))
		.send()
		.await
		.unwrap();
	assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

	// Cancel through the API: not yet executing, so immediately terminal.
	let canceled: serde_json::Value = client
		.post(format!("{}/runs/{}/cancel", platform.endpoint, run_id))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(canceled["snapshot"]["execution_status"], "FINISHED");
}
