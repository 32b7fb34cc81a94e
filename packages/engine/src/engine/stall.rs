use anyhow::Result;
use flywheel_types::{
	ExecutionStatus, InternalErrorCode, RunError, RunStatus,
};
use flywheel_util::Id;

use crate::engine::{Engine, SnapshotParams};

/// What a stall-check decided while holding the run's lock.
enum StallAction {
	None,
	/// Recheck waitpoints produced no blockers; continue outside the lock.
	Continue,
	/// The run finished terminally; complete its waitpoint outside the lock.
	FinishWaitpoint {
		waitpoint_id: Option<Id>,
		output: Option<String>,
	},
}

impl Engine {
	/// Fired by the delayed-job worker when a snapshot's stall timer
	/// elapses. A changed snapshot id means the run moved on and the timer
	/// is stale; otherwise the run is stuck in that state and gets the
	/// status-specific recovery.
	#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
	pub async fn handle_stalled_snapshot(&self, run_id: Id, snapshot_id: Id) -> Result<()> {
		let engine = self.clone();
		let action = self
			.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				let snapshot = engine.latest_snapshot_required(run_id).await?;
				if snapshot.id != snapshot_id {
					// We've moved on; stale timer.
					return Ok(StallAction::None);
				}

				match snapshot.execution_status {
					ExecutionStatus::Finished => Ok(StallAction::None),

					// Sitting in the queue is normal under load; make sure
					// the message actually exists, then keep watching.
					ExecutionStatus::RunCreated | ExecutionStatus::Queued => {
						if engine.queue.read_message(run_id).await?.is_none() {
							tracing::warn!("queued run lost its message, re-enqueueing");
							let env = engine.environment_for_run(&run).await?;
							engine
								.enqueue_run(
									&run,
									&env,
									flywheel_util::timestamp::now(),
									Vec::new(),
								)
								.await?;
						} else {
							engine.schedule_stall_check(&snapshot).await?;
						}
						Ok(StallAction::None)
					}

					// Dequeued but the attempt never started: give the work
					// back to the queue.
					ExecutionStatus::DequeuedForExecution => {
						tracing::warn!("runner never started attempt, re-queueing");
						engine
							.db
							.update_run_status(run_id, RunStatus::Pending)
							.await?;
						engine
							.append_snapshot(
								&run,
								SnapshotParams::basic(
									ExecutionStatus::Queued,
									RunStatus::Pending,
									"Runner failed to start attempt, re-queued",
									&run,
								),
							)
							.await?;
						engine.queue.nack_message(run_id, None).await?;
						Ok(StallAction::None)
					}

					// The attempt went dark: heartbeats stopped long enough
					// ago that the runner is presumed dead.
					ExecutionStatus::Executing
					| ExecutionStatus::ExecutingWithWaitpoints
					| ExecutionStatus::PendingExecuting
					| ExecutionStatus::PendingCancel => engine.crash_or_retry(&run).await,

					// Blocked states re-check for lost wakeups.
					ExecutionStatus::BlockedByWaitpoints | ExecutionStatus::Suspended => {
						if engine.db.blocking_waitpoint_count(run_id).await? == 0 {
							tracing::warn!("blocked run has no blocking waitpoints, continuing");
							Ok(StallAction::Continue)
						} else {
							engine.schedule_stall_check(&snapshot).await?;
							Ok(StallAction::None)
						}
					}
				}
			})
			.await?;

		match action {
			StallAction::None => Ok(()),
			StallAction::Continue => self.continue_run(run_id, Vec::new()).await,
			StallAction::FinishWaitpoint {
				waitpoint_id,
				output,
			} => {
				if let Some(waitpoint_id) = waitpoint_id {
					self.complete_waitpoint(waitpoint_id, output, true).await?;
				}
				Ok(())
			}
		}
	}

	/// Crash recovery for a dead attempt: retry through the queue while
	/// budget remains, terminal `Crashed` otherwise.
	async fn crash_or_retry(&self, run: &flywheel_types::Run) -> Result<StallAction> {
		if let Some(attempt) = self.db.latest_attempt(run.id).await? {
			if attempt.completed_at.is_none() {
				self.db
					.complete_attempt(
						attempt.id,
						flywheel_util::timestamp::now(),
						Some(RunError::internal(
							InternalErrorCode::TaskRunHeartbeatTimeout,
							"Attempt stopped heartbeating",
						)),
					)
					.await?;
			}
		}

		if run.attempt_count < run.max_attempts {
			tracing::warn!(
				run_id=%run.id,
				attempt_count=run.attempt_count,
				"attempt stalled, re-queueing for retry"
			);
			self.db.update_run_status(run.id, RunStatus::Pending).await?;
			self.append_snapshot(
				run,
				SnapshotParams::basic(
					ExecutionStatus::Queued,
					RunStatus::Pending,
					"Attempt stalled, re-queued for retry",
					run,
				),
			)
			.await?;
			self.queue.nack_message(run.id, None).await?;
			return Ok(StallAction::None);
		}

		let error = RunError::internal(
			InternalErrorCode::TaskRunStalled,
			"Run crashed: the runner stopped heartbeating and no retries remain",
		);
		self.db
			.set_run_result(run.id, RunStatus::Crashed, None, Some(error.clone()))
			.await?;
		self.queue.acknowledge_message(run.id).await?;
		self.append_snapshot(
			run,
			SnapshotParams::basic(
				ExecutionStatus::Finished,
				RunStatus::Crashed,
				"Run crashed: heartbeat timeout",
				run,
			),
		)
		.await?;

		tracing::error!(run_id=%run.id, "run crashed");

		Ok(StallAction::FinishWaitpoint {
			waitpoint_id: run.associated_waitpoint_id,
			output: Some(serde_json::to_string(&error)?),
		})
	}

	/// Pages through stale waiting-to-resume runs and repairs lost wakeups:
	/// any such run with no blocking waitpoint rows should have continued.
	#[tracing::instrument(skip_all)]
	pub async fn scan_waiting_runs(&self) -> Result<usize> {
		let threshold =
			flywheel_util::timestamp::now() - self.config.engine().resume_stale_threshold_ms();
		let stale = self.db.list_stale_waiting_runs(threshold, 100).await?;

		let mut repaired = 0;
		for run in stale {
			if self.db.blocking_waitpoint_count(run.id).await? > 0 {
				continue;
			}
			tracing::warn!(run_id=%run.id, "repairing lost wakeup");
			if let Err(err) = self.continue_run(run.id, Vec::new()).await {
				tracing::error!(?err, run_id=%run.id, "failed repairing lost wakeup");
				continue;
			}
			repaired += 1;
		}

		Ok(repaired)
	}
}
