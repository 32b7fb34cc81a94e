use anyhow::Result;
use flywheel_runner_protocol::{SuspendResponse, WaitForDurationResponse};
use flywheel_types::{
	EngineError, ExecutionSnapshot, ExecutionStatus, RunStatus, Waitpoint, WaitpointKind,
	WaitpointStatus,
};
use flywheel_util::Id;
use ratchet::TimerJob;

use crate::engine::{Engine, SnapshotParams};

impl Engine {
	// MARK: Waitpoint creation
	/// Datetime waitpoint plus the timer that completes it.
	pub async fn create_date_time_waitpoint(
		&self,
		project_id: Id,
		completed_after: i64,
		idempotency_key: Option<String>,
	) -> Result<Waitpoint> {
		if let Some(key) = &idempotency_key {
			if let Some(existing) = self
				.db
				.find_waitpoint_by_idempotency_key(project_id, key)
				.await?
			{
				return Ok(existing);
			}
		}

		let waitpoint = Waitpoint {
			id: Id::new(),
			project_id,
			kind: WaitpointKind::DateTime,
			status: WaitpointStatus::Pending,
			completed_after: Some(completed_after),
			completed_by_run_id: None,
			idempotency_key,
			output: None,
			output_is_error: false,
			created_at: flywheel_util::timestamp::now(),
			completed_at: None,
		};
		self.db.create_waitpoint(&waitpoint).await?;

		self.timers
			.enqueue(&TimerJob::new(
				format!("{}.{}", crate::jobs::WAITPOINT_COMPLETE_DATE_TIME, waitpoint.id),
				crate::jobs::WAITPOINT_COMPLETE_DATE_TIME,
				serde_json::json!({ "waitpoint_id": waitpoint.id }),
				completed_after,
			))
			.await?;

		Ok(waitpoint)
	}

	pub async fn create_manual_waitpoint(
		&self,
		project_id: Id,
		idempotency_key: Option<String>,
	) -> Result<Waitpoint> {
		if let Some(key) = &idempotency_key {
			if let Some(existing) = self
				.db
				.find_waitpoint_by_idempotency_key(project_id, key)
				.await?
			{
				return Ok(existing);
			}
		}

		let waitpoint = Waitpoint {
			id: Id::new(),
			project_id,
			kind: WaitpointKind::Manual,
			status: WaitpointStatus::Pending,
			completed_after: None,
			completed_by_run_id: None,
			idempotency_key,
			output: None,
			output_is_error: false,
			created_at: flywheel_util::timestamp::now(),
			completed_at: None,
		};
		self.db.create_waitpoint(&waitpoint).await?;

		Ok(waitpoint)
	}

	// MARK: Blocking
	/// Blocks a run on a waitpoint: join row, status change, concurrency
	/// release, and the matching snapshot.
	#[tracing::instrument(skip_all, fields(%run_id, %waitpoint_id))]
	pub async fn block_run_with_waitpoint(
		&self,
		run_id: Id,
		waitpoint_id: Id,
		run_status: RunStatus,
	) -> Result<ExecutionSnapshot> {
		let waitpoint = self
			.db
			.get_waitpoint(waitpoint_id)
			.await?
			.ok_or(EngineError::WaitpointNotFound(waitpoint_id))?;

		let engine = self.clone();
		self.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				let snapshot = engine.latest_snapshot_required(run_id).await?;

				// A run blocked mid-attempt keeps its runner attached and may
				// later suspend; a run blocked before execution just parks.
				let executing = matches!(
					snapshot.execution_status,
					ExecutionStatus::Executing | ExecutionStatus::ExecutingWithWaitpoints
				);
				let execution_status = if executing {
					ExecutionStatus::ExecutingWithWaitpoints
				} else {
					ExecutionStatus::BlockedByWaitpoints
				};

				engine
					.db
					.block_run_with_waitpoint(run_id, waitpoint.id, waitpoint.project_id, run_status)
					.await?;

				// The blocked run no longer consumes a concurrency slot. The
				// message body survives so unblocking can re-enqueue.
				engine.queue.release_concurrency(run_id).await?;

				engine
					.append_snapshot(
						&run,
						SnapshotParams {
							execution_status,
							run_status,
							description: format!("Run blocked by waitpoint {waitpoint_id}"),
							worker_id: snapshot.worker_id.clone(),
							attempt_number: snapshot.attempt_number,
							completed_waitpoint_ids: Vec::new(),
						},
					)
					.await
			})
			.await
	}

	// MARK: Completion
	/// The only path from Pending to Completed. Unblocked runs continue
	/// outside the waitpoint transaction, each under its own lock.
	#[tracing::instrument(skip_all, fields(%waitpoint_id))]
	pub async fn complete_waitpoint(
		&self,
		waitpoint_id: Id,
		output: Option<String>,
		output_is_error: bool,
	) -> Result<()> {
		let outcome = self
			.db
			.complete_waitpoint(
				waitpoint_id,
				output,
				output_is_error,
				flywheel_util::timestamp::now(),
			)
			.await?;

		if outcome.already_completed {
			tracing::debug!("waitpoint already completed");
			return Ok(());
		}

		for run in outcome.unblocked {
			if let Err(err) = self.continue_run(run.id, vec![waitpoint_id]).await {
				// One stuck run must not wedge every other unblock; the
				// resume scanner retries it.
				tracing::error!(?err, run_id=%run.id, "failed continuing unblocked run");
			}
		}

		Ok(())
	}

	/// Moves a fully-unblocked run out of the blocked state. The only
	/// mechanism that does so.
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn continue_run(&self, run_id: Id, completed_waitpoint_ids: Vec<Id>) -> Result<()> {
		let engine = self.clone();
		self.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				if run.status.is_terminal() {
					tracing::debug!("run already terminal, not continuing");
					return Ok(());
				}
				if engine.db.blocking_waitpoint_count(run_id).await? > 0 {
					tracing::debug!("run still blocked, not continuing");
					return Ok(());
				}

				let snapshot = engine.latest_snapshot_required(run_id).await?;

				match snapshot.execution_status {
					// A runner is still attached (live or suspended); try to
					// take the concurrency slot back without re-queueing.
					ExecutionStatus::ExecutingWithWaitpoints | ExecutionStatus::Suspended => {
						if engine.queue.reacquire_concurrency(run_id).await? {
							let (execution_status, description) = match snapshot.execution_status {
								ExecutionStatus::Suspended => (
									ExecutionStatus::PendingExecuting,
									"Waitpoints completed, waiting for runner to continue",
								),
								_ => (
									ExecutionStatus::Executing,
									"Waitpoints completed, delivering to runner",
								),
							};

							engine
								.db
								.update_run_status(run_id, RunStatus::Executing)
								.await?;
							engine
								.append_snapshot(
									&run,
									SnapshotParams {
										execution_status,
										run_status: RunStatus::Executing,
										description: description.to_string(),
										worker_id: snapshot.worker_id.clone(),
										attempt_number: snapshot.attempt_number,
										completed_waitpoint_ids,
									},
								)
								.await?;
						} else {
							// Budgets are full; go to the back of the queue.
							let env = engine.environment_for_run(&run).await?;
							engine
								.enqueue_run(
									&run,
									&env,
									flywheel_util::timestamp::now(),
									completed_waitpoint_ids,
								)
								.await?;
						}
					}
					// Blocked before execution (delay, lost wakeup, parent
					// blocked while queued): plain re-enqueue.
					_ => {
						let env = engine.environment_for_run(&run).await?;
						engine
							.enqueue_run(
								&run,
								&env,
								flywheel_util::timestamp::now(),
								completed_waitpoint_ids,
							)
							.await?;
					}
				}

				Ok(())
			})
			.await
	}

	// MARK: Runner-driven waits
	/// `wait.for`-style duration wait requested from inside an attempt.
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn wait_for_duration(
		&self,
		run_id: Id,
		snapshot_id: Id,
		date: i64,
	) -> Result<WaitForDurationResponse> {
		let run = self.get_run(run_id).await?;
		let latest = self.latest_snapshot_required(run_id).await?;
		if latest.id != snapshot_id {
			return Err(EngineError::SnapshotMismatch {
				run_id,
				latest: latest.id,
				provided: snapshot_id,
			}
			.into());
		}

		let waitpoint = self
			.create_date_time_waitpoint(run.project_id, date, None)
			.await?;
		let snapshot = self
			.block_run_with_waitpoint(run_id, waitpoint.id, RunStatus::WaitingToResume)
			.await?;

		Ok(WaitForDurationResponse {
			waitpoint_id: waitpoint.id,
			snapshot,
		})
	}

	/// A runner asking to shut its child process down while blocked. Granted
	/// only when the run is still blocked; declined requests keep the runner
	/// alive (the waitpoints may already have completed).
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn suspend_run(&self, run_id: Id, snapshot_id: Id) -> Result<SuspendResponse> {
		let engine = self.clone();
		self.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				let snapshot = engine.latest_snapshot_required(run_id).await?;
				if snapshot.id != snapshot_id {
					return Err(EngineError::SnapshotMismatch {
						run_id,
						latest: snapshot.id,
						provided: snapshot_id,
					}
					.into());
				}

				let blocked = engine.db.blocking_waitpoint_count(run_id).await? > 0;
				if snapshot.execution_status != ExecutionStatus::ExecutingWithWaitpoints || !blocked
				{
					tracing::debug!("declining suspension");
					return Ok(SuspendResponse { ok: false });
				}

				engine
					.append_snapshot(
						&run,
						SnapshotParams {
							execution_status: ExecutionStatus::Suspended,
							run_status: RunStatus::WaitingToResume,
							description: "Runner suspended".to_string(),
							worker_id: snapshot.worker_id.clone(),
							attempt_number: snapshot.attempt_number,
							completed_waitpoint_ids: Vec::new(),
						},
					)
					.await?;

				Ok(SuspendResponse { ok: true })
			})
			.await
	}

	/// The runner acknowledging a `PendingExecuting` snapshot and resuming
	/// the attempt in place.
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn continue_run_execution(
		&self,
		run_id: Id,
		snapshot_id: Id,
	) -> Result<flywheel_runner_protocol::RunExecutionData> {
		let engine = self.clone();
		self.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				let snapshot = engine.latest_snapshot_required(run_id).await?;
				if snapshot.id != snapshot_id {
					return Err(EngineError::SnapshotMismatch {
						run_id,
						latest: snapshot.id,
						provided: snapshot_id,
					}
					.into());
				}
				if snapshot.execution_status != ExecutionStatus::PendingExecuting {
					return Err(EngineError::InvalidState {
						run_id,
						operation: "continue execution",
						state: snapshot.execution_status.to_string(),
					}
					.into());
				}

				engine
					.append_snapshot(
						&run,
						SnapshotParams {
							execution_status: ExecutionStatus::Executing,
							run_status: RunStatus::Executing,
							description: "Runner continued after suspension".to_string(),
							worker_id: snapshot.worker_id.clone(),
							attempt_number: snapshot.attempt_number,
							// Carry the deliveries into the authoritative
							// snapshot the runner fetches next.
							completed_waitpoint_ids: snapshot.completed_waitpoint_ids.clone(),
						},
					)
					.await?;

				Ok(())
			})
			.await?;

		self.get_execution_data(run_id).await
	}
}
