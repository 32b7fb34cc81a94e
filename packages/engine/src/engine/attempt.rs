use anyhow::Result;
use flywheel_runner_protocol::{
	CompleteAttemptResponse, StartAttemptRequest, StartAttemptResponse,
};
use flywheel_types::{
	Attempt, AttemptCompletion, AttemptStatus, EngineError, ExecutionSnapshot, ExecutionStatus,
	RunError, RunErrorKind, RunStatus,
};
use flywheel_util::Id;

use crate::engine::{Engine, SnapshotParams};

impl Engine {
	/// Starts an attempt against a specific snapshot. A stale snapshot id is
	/// a retryable conflict; the runner re-fetches and decides.
	#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id, is_warm_start=request.is_warm_start))]
	pub async fn start_attempt(
		&self,
		run_id: Id,
		snapshot_id: Id,
		request: StartAttemptRequest,
	) -> Result<StartAttemptResponse> {
		let engine = self.clone();
		self.locks
			.with_run_lock(run_id, || async move {
				let mut run = engine.get_run(run_id).await?;
				let snapshot = engine.latest_snapshot_required(run_id).await?;
				if snapshot.id != snapshot_id {
					return Err(EngineError::SnapshotMismatch {
						run_id,
						latest: snapshot.id,
						provided: snapshot_id,
					}
					.into());
				}
				if !matches!(
					snapshot.execution_status,
					ExecutionStatus::DequeuedForExecution | ExecutionStatus::PendingExecuting
				) {
					return Err(EngineError::InvalidState {
						run_id,
						operation: "start attempt",
						state: snapshot.execution_status.to_string(),
					}
					.into());
				}

				let attempt_number = run.attempt_count + 1;
				let attempt = Attempt {
					id: Id::new(),
					run_id,
					number: attempt_number,
					worker_id: snapshot.worker_id.clone(),
					started_at: flywheel_util::timestamp::now(),
					completed_at: None,
					error: None,
				};
				engine.db.create_attempt(&attempt).await?;
				engine.db.set_run_attempt_count(run_id, attempt_number).await?;
				engine
					.db
					.update_run_status(run_id, RunStatus::Executing)
					.await?;
				run.attempt_count = attempt_number;
				run.status = RunStatus::Executing;

				let next = engine
					.append_snapshot(
						&run,
						SnapshotParams {
							execution_status: ExecutionStatus::Executing,
							run_status: RunStatus::Executing,
							description: format!("Attempt {attempt_number} started"),
							worker_id: snapshot.worker_id.clone(),
							attempt_number,
							completed_waitpoint_ids: snapshot.completed_waitpoint_ids.clone(),
						},
					)
					.await?;

				let env = engine.environment_for_run(&run).await?;

				Ok(StartAttemptResponse {
					run,
					snapshot: next,
					attempt_number,
					env_vars: env.env_vars,
				})
			})
			.await
	}

	/// A runner submitting the result of an attempt. Decides between
	/// finishing, retrying in place, and retrying through the queue.
	#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id, ok=completion.ok))]
	pub async fn complete_attempt(
		&self,
		run_id: Id,
		snapshot_id: Id,
		completion: AttemptCompletion,
	) -> Result<CompleteAttemptResponse> {
		let engine = self.clone();
		let (response, finish) = self
			.locks
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
				if !snapshot.execution_status.has_live_worker() {
					return Err(EngineError::InvalidState {
						run_id,
						operation: "complete attempt",
						state: snapshot.execution_status.to_string(),
					}
					.into());
				}

				// A cancel the runner has not observed yet wins over any
				// result except the runner's own abort acknowledgement.
				let aborted = completion
					.error
					.as_ref()
					.map(|error| error.kind == RunErrorKind::Aborted)
					.unwrap_or(false);
				if snapshot.execution_status == ExecutionStatus::PendingCancel && !aborted {
					return Ok((
						CompleteAttemptResponse {
							attempt_status: AttemptStatus::RunPendingCancel,
							snapshot,
							retry_delay_ms: None,
						},
						None,
					));
				}

				engine.complete_attempt_row(&run, &completion).await?;

				if completion.ok {
					let next = engine
						.finish_run(
							&run,
							&snapshot,
							RunStatus::CompletedSuccessfully,
							completion.output.clone(),
							None,
						)
						.await?;
					return Ok((
						CompleteAttemptResponse {
							attempt_status: AttemptStatus::RunFinished,
							snapshot: next,
							retry_delay_ms: None,
						},
						Some(FinishWaitpoint {
							run: Box::new(run),
							output: completion.output,
							output_is_error: false,
						}),
					));
				}

				if aborted {
					let error = completion
						.error
						.clone()
						.unwrap_or_else(|| RunError::aborted("Run canceled"));
					let next = engine
						.finish_run(&run, &snapshot, RunStatus::Canceled, None, Some(error.clone()))
						.await?;
					return Ok((
						CompleteAttemptResponse {
							attempt_status: AttemptStatus::RunFinished,
							snapshot: next,
							retry_delay_ms: None,
						},
						Some(FinishWaitpoint {
							run: Box::new(run),
							output: Some(serde_json::to_string(&error)?),
							output_is_error: true,
						}),
					));
				}

				// Failure with retry budget left goes back through one of
				// the two retry paths.
				let retriable = completion.retry.is_some() && run.attempt_count < run.max_attempts;
				if retriable {
					let delay_ms = completion.retry.map(|retry| retry.delay_ms).unwrap_or(0);

					if delay_ms < engine.config.engine().retry_immediately_threshold_ms() {
						// The runner sleeps the delay itself and starts a new
						// attempt against this snapshot.
						let next = engine
							.append_snapshot(
								&run,
								SnapshotParams {
									execution_status: ExecutionStatus::PendingExecuting,
									run_status: RunStatus::Executing,
									description: format!(
										"Attempt {} failed, retrying in place",
										run.attempt_count
									),
									worker_id: snapshot.worker_id.clone(),
									attempt_number: run.attempt_count,
									completed_waitpoint_ids: Vec::new(),
								},
							)
							.await?;
						return Ok((
							CompleteAttemptResponse {
								attempt_status: AttemptStatus::RetryImmediately,
								snapshot: next,
								retry_delay_ms: Some(delay_ms),
							},
							None,
						));
					}

					// Queue-level retry frees the runner for other work.
					let retry_at = flywheel_util::timestamp::now() + delay_ms;
					engine.db.update_run_status(run_id, RunStatus::Pending).await?;
					let next = engine
						.append_snapshot(
							&run,
							SnapshotParams {
								execution_status: ExecutionStatus::Queued,
								run_status: RunStatus::Pending,
								description: format!(
									"Attempt {} failed, retry queued",
									run.attempt_count
								),
								worker_id: None,
								attempt_number: run.attempt_count,
								completed_waitpoint_ids: Vec::new(),
							},
						)
						.await?;
					engine.queue.nack_message(run_id, Some(retry_at)).await?;
					return Ok((
						CompleteAttemptResponse {
							attempt_status: AttemptStatus::RetryQueued,
							snapshot: next,
							retry_delay_ms: Some(delay_ms),
						},
						None,
					));
				}

				// Out of attempts (or no retry requested): terminal failure.
				let error = completion
					.error
					.clone()
					.unwrap_or_else(|| RunError::user("Task failed without an error payload"));
				let next = engine
					.finish_run(
						&run,
						&snapshot,
						RunStatus::CompletedWithErrors,
						None,
						Some(error.clone()),
					)
					.await?;
				Ok((
					CompleteAttemptResponse {
						attempt_status: AttemptStatus::RunFinished,
						snapshot: next,
						retry_delay_ms: None,
					},
					Some(FinishWaitpoint {
						run: Box::new(run),
						output: Some(serde_json::to_string(&error)?),
						output_is_error: true,
					}),
				))
			})
			.await?;

		// The associated waitpoint completes outside the run's lock; it
		// takes the locks of any blocked parents.
		if let Some(finish) = finish {
			if let Some(waitpoint_id) = finish.run.associated_waitpoint_id {
				self.complete_waitpoint(waitpoint_id, finish.output, finish.output_is_error)
					.await?;
			}
		}

		Ok(response)
	}

	/// Extends the stall-check for the given snapshot. Mismatched ids mean
	/// the run moved on; the runner finds out via its poll.
	#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
	pub async fn heartbeat(&self, run_id: Id, snapshot_id: Id) -> Result<ExecutionSnapshot> {
		let snapshot = self.latest_snapshot_required(run_id).await?;
		if snapshot.id != snapshot_id {
			return Err(EngineError::SnapshotMismatch {
				run_id,
				latest: snapshot.id,
				provided: snapshot_id,
			}
			.into());
		}

		self.schedule_stall_check(&snapshot).await?;

		Ok(snapshot)
	}

	async fn complete_attempt_row(
		&self,
		run: &flywheel_types::Run,
		completion: &AttemptCompletion,
	) -> Result<()> {
		if let Some(attempt) = self.db.latest_attempt(run.id).await? {
			self.db
				.complete_attempt(
					attempt.id,
					flywheel_util::timestamp::now(),
					completion.error.clone(),
				)
				.await?;
		}
		Ok(())
	}

	/// Terminal bookkeeping shared by every finish path: result row, queue
	/// acknowledge, and the `Finished` snapshot.
	pub(crate) async fn finish_run(
		&self,
		run: &flywheel_types::Run,
		snapshot: &ExecutionSnapshot,
		status: RunStatus,
		output: Option<String>,
		error: Option<RunError>,
	) -> Result<ExecutionSnapshot> {
		self.db
			.set_run_result(run.id, status, output, error)
			.await?;
		self.queue.acknowledge_message(run.id).await?;

		self.append_snapshot(
			run,
			SnapshotParams {
				execution_status: ExecutionStatus::Finished,
				run_status: status,
				description: format!("Run finished: {status}"),
				worker_id: snapshot.worker_id.clone(),
				attempt_number: snapshot.attempt_number,
				completed_waitpoint_ids: Vec::new(),
			},
		)
		.await
	}
}

struct FinishWaitpoint {
	run: Box<flywheel_types::Run>,
	output: Option<String>,
	output_is_error: bool,
}
