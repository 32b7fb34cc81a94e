use anyhow::Result;
use flywheel_types::{
	ExecutionSnapshot, ExecutionStatus, RunError, RunStatus,
};
use flywheel_util::Id;

use crate::engine::{Engine, SnapshotParams};

/// What still needs to happen after the run's lock is released.
struct TerminalFollowUp {
	waitpoint_id: Option<Id>,
	output: Option<String>,
}

impl Engine {
	/// TTL enforcement. Only runs that never started executing can expire.
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn expire(&self, run_id: Id) -> Result<()> {
		let engine = self.clone();
		let follow_up = self
			.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				if run.status.is_terminal() {
					return Ok(None);
				}

				let snapshot = engine.latest_snapshot_required(run_id).await?;
				if !matches!(
					snapshot.execution_status,
					ExecutionStatus::RunCreated
						| ExecutionStatus::Queued
						| ExecutionStatus::BlockedByWaitpoints
				) {
					tracing::debug!(
						execution_status=%snapshot.execution_status,
						"run started executing before ttl, not expiring"
					);
					return Ok(None);
				}

				let error = RunError::expired();
				engine
					.db
					.set_run_result(run_id, RunStatus::Expired, None, Some(error.clone()))
					.await?;
				engine.queue.acknowledge_message(run_id).await?;
				engine
					.append_snapshot(
						&run,
						SnapshotParams::basic(
							ExecutionStatus::Finished,
							RunStatus::Expired,
							"Run expired: ttl elapsed before dequeue",
							&run,
						),
					)
					.await?;

				tracing::info!("run expired");

				Ok(Some(TerminalFollowUp {
					waitpoint_id: run.associated_waitpoint_id,
					output: Some(serde_json::to_string(&error)?),
				}))
			})
			.await?;

		self.run_follow_up(follow_up).await
	}

	/// Unrecoverable engine-side failure. Terminal for the run, never
	/// retried.
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn system_failure(&self, run_id: Id, error: RunError) -> Result<()> {
		let engine = self.clone();
		let failure = error.clone();
		let follow_up = self
			.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				if run.status.is_terminal() {
					return Ok(None);
				}

				engine
					.db
					.set_run_result(run_id, RunStatus::SystemFailure, None, Some(failure.clone()))
					.await?;
				engine.queue.acknowledge_message(run_id).await?;
				engine
					.append_snapshot(
						&run,
						SnapshotParams::basic(
							ExecutionStatus::Finished,
							RunStatus::SystemFailure,
							format!("Run failed: {}", failure.message),
							&run,
						),
					)
					.await?;

				tracing::error!(code=?failure.code, message=%failure.message, "run system failure");

				Ok(Some(TerminalFollowUp {
					waitpoint_id: run.associated_waitpoint_id,
					output: Some(serde_json::to_string(&failure)?),
				}))
			})
			.await?;

		self.run_follow_up(follow_up).await
	}

	/// Cancels a run. Executing runs get a `PendingCancel` snapshot and
	/// finish through the runner's abort completion; parked runs cancel
	/// immediately.
	#[tracing::instrument(skip_all, fields(%run_id))]
	pub async fn cancel(&self, run_id: Id) -> Result<ExecutionSnapshot> {
		let engine = self.clone();
		let (snapshot, follow_up) = self
			.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				let snapshot = engine.latest_snapshot_required(run_id).await?;

				if run.status.is_terminal()
					|| snapshot.execution_status == ExecutionStatus::PendingCancel
				{
					return Ok((snapshot, None));
				}

				// A live runner must flush and abort its child; the engine
				// only signals.
				let live_worker = matches!(
					snapshot.execution_status,
					ExecutionStatus::Executing
						| ExecutionStatus::ExecutingWithWaitpoints
						| ExecutionStatus::PendingExecuting
						| ExecutionStatus::DequeuedForExecution
				);
				if live_worker {
					let next = engine
						.append_snapshot(
							&run,
							SnapshotParams {
								execution_status: ExecutionStatus::PendingCancel,
								run_status: run.status,
								description: "Cancel requested".to_string(),
								worker_id: snapshot.worker_id.clone(),
								attempt_number: snapshot.attempt_number,
								completed_waitpoint_ids: Vec::new(),
							},
						)
						.await?;
					return Ok((next, None));
				}

				// Not executing: cancel in place.
				let error = RunError::aborted("Run canceled before execution");
				engine
					.db
					.set_run_result(run_id, RunStatus::Canceled, None, Some(error.clone()))
					.await?;
				engine.queue.acknowledge_message(run_id).await?;
				let next = engine
					.append_snapshot(
						&run,
						SnapshotParams::basic(
							ExecutionStatus::Finished,
							RunStatus::Canceled,
							"Run canceled",
							&run,
						),
					)
					.await?;

				Ok((
					next,
					Some(TerminalFollowUp {
						waitpoint_id: run.associated_waitpoint_id,
						output: Some(serde_json::to_string(&error)?),
					}),
				))
			})
			.await?;

		self.run_follow_up(follow_up).await?;

		Ok(snapshot)
	}

	async fn run_follow_up(&self, follow_up: Option<TerminalFollowUp>) -> Result<()> {
		if let Some(follow_up) = follow_up {
			if let Some(waitpoint_id) = follow_up.waitpoint_id {
				self.complete_waitpoint(waitpoint_id, follow_up.output, true)
					.await?;
			}
		}
		Ok(())
	}
}
