use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use conveyor::RunQueue;
use flywheel_types::{
	EngineError, Environment, ExecutionSnapshot, ExecutionStatus, QueueMessage, Run, RunStatus,
};
use flywheel_util::Id;
use ratchet::{TimerDriverHandle, TimerJob};

use crate::db::DatabaseHandle;
use crate::entitlement::EntitlementChecker;
use crate::lock::LockManager;
use crate::notify::RunNotifier;

pub mod attempt;
pub mod dequeue;
pub mod stall;
pub mod terminal;
pub mod trigger;
pub mod waitpoint;

pub struct EngineInner {
	pub(crate) config: flywheel_config::Config,
	pub(crate) db: DatabaseHandle,
	pub(crate) queue: RunQueue,
	pub(crate) timers: TimerDriverHandle,
	pub(crate) locks: LockManager,
	pub(crate) entitlements: Arc<dyn EntitlementChecker>,
	notifier: OnceLock<Arc<dyn RunNotifier>>,
}

/// The run engine. Owns every run status transition; everything else
/// (queue, timers, API, runners) works through it.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl Deref for Engine {
	type Target = EngineInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Engine {
	pub fn new(
		config: flywheel_config::Config,
		db: DatabaseHandle,
		queue: RunQueue,
		timers: TimerDriverHandle,
		locks: LockManager,
		entitlements: Arc<dyn EntitlementChecker>,
	) -> Self {
		Engine(Arc::new(EngineInner {
			config,
			db,
			queue,
			timers,
			locks,
			entitlements,
			notifier: OnceLock::new(),
		}))
	}

	/// Installs the push channel once the transport layer exists. Without it
	/// runners rely on the snapshot poll alone.
	pub fn set_notifier(&self, notifier: Arc<dyn RunNotifier>) {
		if self.notifier.set(notifier).is_err() {
			tracing::warn!("run notifier already set, ignoring");
		}
	}

	pub fn db(&self) -> &DatabaseHandle {
		&self.db
	}

	pub fn queue(&self) -> &RunQueue {
		&self.queue
	}

	// MARK: Reads
	pub async fn get_run(&self, run_id: Id) -> Result<Run> {
		self.db
			.get_run(run_id)
			.await?
			.ok_or_else(|| EngineError::RunNotFound(run_id).into())
	}

	pub(crate) async fn latest_snapshot_required(&self, run_id: Id) -> Result<ExecutionSnapshot> {
		self.db
			.latest_snapshot(run_id)
			.await?
			.ok_or_else(|| EngineError::NoSnapshot(run_id).into())
	}

	/// Latest run + snapshot + resolved waitpoint completions, as served to
	/// runners and the dashboard.
	pub async fn get_execution_data(
		&self,
		run_id: Id,
	) -> Result<flywheel_runner_protocol::RunExecutionData> {
		let run = self.get_run(run_id).await?;
		let snapshot = self.latest_snapshot_required(run_id).await?;

		let mut completed_waitpoints = Vec::with_capacity(snapshot.completed_waitpoint_ids.len());
		for waitpoint_id in &snapshot.completed_waitpoint_ids {
			if let Some(waitpoint) = self.db.get_waitpoint(*waitpoint_id).await? {
				completed_waitpoints
					.push(flywheel_types::CompletedWaitpoint::from_waitpoint(&waitpoint));
			}
		}

		Ok(flywheel_runner_protocol::RunExecutionData {
			run,
			snapshot,
			completed_waitpoints,
		})
	}

	// MARK: Snapshot log
	/// Appends a snapshot, schedules its stall-check, and pushes a notify.
	/// This is the only way a snapshot is ever produced.
	pub(crate) async fn append_snapshot(
		&self,
		run: &Run,
		params: SnapshotParams,
	) -> Result<ExecutionSnapshot> {
		let snapshot = ExecutionSnapshot {
			id: Id::new(),
			run_id: run.id,
			execution_status: params.execution_status,
			run_status: params.run_status,
			description: params.description,
			worker_id: params.worker_id,
			attempt_number: params.attempt_number,
			completed_waitpoint_ids: params.completed_waitpoint_ids,
			created_at: flywheel_util::timestamp::now(),
		};

		self.db.insert_snapshot(&snapshot).await?;
		self.schedule_stall_check(&snapshot).await?;

		tracing::debug!(
			run_id=%run.id,
			snapshot_id=%snapshot.id,
			execution_status=%snapshot.execution_status,
			run_status=%snapshot.run_status,
			"appended snapshot"
		);

		if let Some(notifier) = self.notifier.get() {
			let notifier = notifier.clone();
			let run_id = run.id;
			tokio::spawn(async move {
				notifier.notify(run_id).await;
			});
		}

		Ok(snapshot)
	}

	pub(crate) fn stall_interval_ms(&self, execution_status: ExecutionStatus) -> i64 {
		let engine_config = self.config.engine();
		if execution_status.has_live_worker() {
			engine_config.stall_check_executing_ms()
		} else {
			engine_config.stall_check_idle_ms()
		}
	}

	/// Arms (or re-arms) the stall-check for a snapshot. The deterministic
	/// job id makes heartbeat extensions collapse into the same timer.
	pub(crate) async fn schedule_stall_check(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
		self.timers
			.enqueue(&TimerJob::new(
				format!("{}.{}", crate::jobs::HEARTBEAT_SNAPSHOT, snapshot.id),
				crate::jobs::HEARTBEAT_SNAPSHOT,
				serde_json::json!({
					"run_id": snapshot.run_id,
					"snapshot_id": snapshot.id,
				}),
				flywheel_util::timestamp::now() + self.stall_interval_ms(snapshot.execution_status),
			))
			.await
	}

	// MARK: Queue plumbing
	pub(crate) async fn environment_for_run(&self, run: &Run) -> Result<Environment> {
		self.db
			.get_environment(run.environment_id)
			.await?
			.with_context(|| format!("environment {} missing for run {}", run.environment_id, run.id))
	}

	pub(crate) fn queue_message_for_run(&self, run: &Run) -> QueueMessage {
		QueueMessage {
			run_id: run.id,
			task_identifier: run.task_identifier.clone(),
			organization_id: run.organization_id,
			project_id: run.project_id,
			environment_id: run.environment_id,
			environment_type: run.environment_type,
			queue_name: run.queue_name.clone(),
			concurrency_key: run.concurrency_key.clone(),
			enqueued_at: flywheel_util::timestamp::now(),
			attempt_count: run.attempt_count,
		}
	}

	/// Moves the run into the queue: status `Pending`, snapshot `Queued`,
	/// message (re)written. Must run under the run's lock.
	pub(crate) async fn enqueue_run(
		&self,
		run: &Run,
		env: &Environment,
		available_at: i64,
		completed_waitpoint_ids: Vec<Id>,
	) -> Result<ExecutionSnapshot> {
		self.db.update_run_status(run.id, RunStatus::Pending).await?;

		let snapshot = self
			.append_snapshot(
				run,
				SnapshotParams {
					execution_status: ExecutionStatus::Queued,
					run_status: RunStatus::Pending,
					description: "Run queued".to_string(),
					worker_id: None,
					attempt_number: run.attempt_count,
					completed_waitpoint_ids,
				},
			)
			.await?;

		let message = self.queue_message_for_run(run);
		self.queue
			.enqueue_message(env, &run.master_queue, &message, available_at, run.priority_ms)
			.await?;

		Ok(snapshot)
	}
}

pub(crate) struct SnapshotParams {
	pub execution_status: ExecutionStatus,
	pub run_status: RunStatus,
	pub description: String,
	pub worker_id: Option<String>,
	pub attempt_number: u32,
	pub completed_waitpoint_ids: Vec<Id>,
}

impl SnapshotParams {
	/// Params carrying over the run's current attempt number with no
	/// waitpoint deliveries.
	pub fn basic(
		execution_status: ExecutionStatus,
		run_status: RunStatus,
		description: impl Into<String>,
		run: &Run,
	) -> Self {
		SnapshotParams {
			execution_status,
			run_status,
			description: description.into(),
			worker_id: None,
			attempt_number: run.attempt_count,
			completed_waitpoint_ids: Vec::new(),
		}
	}
}
