use anyhow::Result;
use flywheel_types::{
	EngineError, Environment, ExecutionStatus, Run, RunStatus, TaskQueue, TaskQueueKind,
	Waitpoint, WaitpointKind, WaitpointStatus,
};
use flywheel_util::Id;
use ratchet::TimerJob;
use serde::Deserialize;

use crate::engine::{Engine, SnapshotParams};

/// Everything a caller can say about a new run.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
	pub task_identifier: String,
	pub payload: String,
	#[serde(default = "default_payload_type")]
	pub payload_type: String,
	pub environment: Environment,

	/// Defaults to the task's virtual queue `task/{task_identifier}`.
	pub queue_name: Option<String>,
	/// Upserts the queue's declared limit before enqueueing.
	pub queue_concurrency_limit: Option<u32>,
	pub concurrency_key: Option<String>,
	pub idempotency_key: Option<String>,
	pub max_attempts: Option<u32>,
	#[serde(default)]
	pub priority_ms: i64,
	pub ttl_ms: Option<i64>,
	pub delay_until: Option<i64>,
	#[serde(default)]
	pub tags: Vec<String>,

	pub parent_run_id: Option<Id>,
	pub parent_attempt_id: Option<Id>,
	pub batch_id: Option<Id>,
	#[serde(default)]
	pub resume_parent_on_completion: bool,

	pub trace_context: Option<serde_json::Value>,
}

fn default_payload_type() -> String {
	"application/json".to_string()
}

impl Engine {
	/// Creates a run and everything attached to it: the initial snapshot,
	/// the run-associated waitpoint, parent blocking, delay/ttl timers, and
	/// the queue entry.
	#[tracing::instrument(skip_all, fields(task=%request.task_identifier))]
	pub async fn trigger(&self, request: TriggerRequest) -> Result<Run> {
		if request.task_identifier.is_empty() {
			return Err(EngineError::Validation("task identifier cannot be empty".into()).into());
		}

		self.entitlements
			.check(request.environment.organization_id)
			.await?;

		self.db.upsert_environment(&request.environment).await?;
		self.queue
			.update_env_concurrency_limits(&request.environment)
			.await?;

		// Idempotent triggers return the existing run with no side effects.
		if let Some(idempotency_key) = &request.idempotency_key {
			if let Some(existing) = self
				.db
				.find_run_by_idempotency_key(request.environment.id, idempotency_key)
				.await?
			{
				tracing::debug!(run_id=%existing.id, "trigger matched idempotency key");
				return Ok(existing);
			}
		}

		let env = request.environment.clone();
		let now = flywheel_util::timestamp::now();
		let run_id = Id::new();

		// Parent linkage resolves the root before any rows exist.
		let (root_run_id, depth) = match request.parent_run_id {
			Some(parent_id) => {
				let parent = self.get_run(parent_id).await?;
				(Some(parent.root_run_id.unwrap_or(parent.id)), parent.depth + 1)
			}
			None => (None, 0),
		};

		let queue_name = request
			.queue_name
			.clone()
			.unwrap_or_else(|| format!("task/{}", request.task_identifier));
		conveyor::keys::validate_queue_name(&queue_name)
			.map_err(|err| EngineError::Validation(err.to_string()))?;

		let associated_waitpoint = Waitpoint {
			id: Id::new(),
			project_id: env.project_id,
			kind: WaitpointKind::Run,
			status: WaitpointStatus::Pending,
			completed_after: None,
			completed_by_run_id: Some(run_id),
			idempotency_key: None,
			output: None,
			output_is_error: false,
			created_at: now,
			completed_at: None,
		};

		let run = Run {
			id: run_id,
			friendly_id: flywheel_util::id::friendly_id("run", run_id),
			status: if request.delay_until.is_some() {
				RunStatus::Delayed
			} else {
				RunStatus::Pending
			},
			task_identifier: request.task_identifier.clone(),
			payload: request.payload.clone(),
			payload_type: request.payload_type.clone(),
			organization_id: env.organization_id,
			project_id: env.project_id,
			environment_id: env.id,
			environment_type: env.env_type,
			queue_name: queue_name.clone(),
			master_queue: self.queue.master_queue_name(&env),
			concurrency_key: request.concurrency_key.clone(),
			idempotency_key: request.idempotency_key.clone(),
			max_attempts: request
				.max_attempts
				.unwrap_or_else(|| self.config.engine().default_max_attempts()),
			attempt_count: 0,
			priority_ms: request.priority_ms,
			ttl_ms: request.ttl_ms,
			delay_until: request.delay_until,
			tags: request.tags.clone(),
			parent_run_id: request.parent_run_id,
			parent_attempt_id: request.parent_attempt_id,
			root_run_id,
			batch_id: request.batch_id,
			depth,
			resume_parent_on_completion: request.resume_parent_on_completion,
			associated_waitpoint_id: Some(associated_waitpoint.id),
			trace_context: request.trace_context.clone(),
			output: None,
			error: None,
			created_at: now,
			updated_at: now,
		};

		let engine = self.clone();
		let created = self
			.locks
			.with_run_lock(run_id, || async move {
				let initial_snapshot = flywheel_types::ExecutionSnapshot {
					id: Id::new(),
					run_id: run.id,
					execution_status: ExecutionStatus::RunCreated,
					run_status: run.status,
					description: "Run created".to_string(),
					worker_id: None,
					attempt_number: 0,
					completed_waitpoint_ids: Vec::new(),
					created_at: now,
				};

				engine
					.db
					.create_run(&run, &initial_snapshot, &associated_waitpoint)
					.await?;
				engine.schedule_stall_check(&initial_snapshot).await?;

				// The parent must be blocked before this run can possibly
				// complete, or its completion races the block and the parent
				// sleeps forever. Different run, different lock; no cycle.
				if run.resume_parent_on_completion {
					if let Some(parent_run_id) = run.parent_run_id {
						engine
							.block_run_with_waitpoint(
								parent_run_id,
								associated_waitpoint.id,
								RunStatus::WaitingToResume,
							)
							.await?;
					}
				}

				// Queue options declared on the trigger flow through to the
				// run queue before the run can be dequeued.
				if let Some(limit) = request.queue_concurrency_limit {
					engine
						.db
						.upsert_task_queue(&TaskQueue {
							environment_id: env.id,
							name: queue_name.clone(),
							concurrency_limit: Some(limit),
							rate_limit: None,
							kind: if request.queue_name.is_some() {
								TaskQueueKind::Named
							} else {
								TaskQueueKind::Virtual
							},
						})
						.await?;
					engine
						.queue
						.update_queue_concurrency_limits(&env, &queue_name, limit)
						.await?;
				}

				if let Some(delay_until) = request.delay_until {
					// The run sleeps on a datetime waitpoint until the delay
					// elapses.
					let delay_waitpoint = engine
						.create_date_time_waitpoint(env.project_id, delay_until, None)
						.await?;
					engine
						.db
						.block_run_with_waitpoint(
							run.id,
							delay_waitpoint.id,
							env.project_id,
							RunStatus::Delayed,
						)
						.await?;
					engine
						.append_snapshot(
							&run,
							SnapshotParams::basic(
								ExecutionStatus::BlockedByWaitpoints,
								RunStatus::Delayed,
								"Run delayed until waitpoint completes",
								&run,
							),
						)
						.await?;
				} else {
					if let Some(ttl_ms) = run.ttl_ms {
						engine
							.timers
							.enqueue(&TimerJob::new(
								format!("{}.{}", crate::jobs::EXPIRE_RUN, run.id),
								crate::jobs::EXPIRE_RUN,
								serde_json::json!({ "run_id": run.id }),
								now + ttl_ms,
							))
							.await?;
					}

					engine.enqueue_run(&run, &env, now, Vec::new()).await?;
				}

				Ok(run)
			})
			.await?;

		tracing::info!(run_id=%created.id, friendly_id=%created.friendly_id, "triggered run");

		Ok(created)
	}
}
