use anyhow::Result;
use flywheel_runner_protocol::DequeuedMessage;
use flywheel_types::{ExecutionStatus, InternalErrorCode, RunError, RunStatus};

use crate::engine::{Engine, SnapshotParams};

impl Engine {
	/// Pulls one message for a supervisor. A claimed message whose run is in
	/// an impossible state is failed terminally rather than redelivered
	/// forever.
	#[tracing::instrument(skip_all, fields(%consumer_id, %master_queue))]
	pub async fn dequeue_from_master_queue(
		&self,
		consumer_id: &str,
		master_queue: &str,
	) -> Result<Option<DequeuedMessage>> {
		let Some(message) = self
			.queue
			.dequeue_message_in_shared_queue(consumer_id, master_queue)
			.await?
		else {
			return Ok(None);
		};

		let run_id = message.run_id;
		let consumer = consumer_id.to_string();
		let engine = self.clone();
		let outcome = self
			.locks
			.with_run_lock(run_id, || async move {
				let run = engine.get_run(run_id).await?;
				let snapshot = engine.latest_snapshot_required(run_id).await?;

				// Lost-wakeup dequeues from BlockedByWaitpoints are legal;
				// anything else claimed off the queue is a corrupted state.
				if !matches!(
					snapshot.execution_status,
					ExecutionStatus::Queued | ExecutionStatus::BlockedByWaitpoints
				) {
					return Ok(DequeueOutcome::InvalidState {
						state: snapshot.execution_status.to_string(),
					});
				}

				let next = engine
					.append_snapshot(
						&run,
						SnapshotParams {
							execution_status: ExecutionStatus::DequeuedForExecution,
							run_status: RunStatus::Pending,
							description: "Run dequeued for execution".to_string(),
							worker_id: Some(consumer),
							attempt_number: run.attempt_count,
							completed_waitpoint_ids: snapshot.completed_waitpoint_ids.clone(),
						},
					)
					.await?;

				Ok(DequeueOutcome::Dequeued(DequeuedMessage {
					run_id: run.id,
					friendly_id: run.friendly_id.clone(),
					snapshot_id: next.id,
					task_identifier: run.task_identifier.clone(),
					payload: run.payload.clone(),
					payload_type: run.payload_type.clone(),
					attempt_count: run.attempt_count,
					max_attempts: run.max_attempts,
					environment_id: run.environment_id,
					environment_type: run.environment_type,
					trace_context: run.trace_context.clone(),
				}))
			})
			.await?;

		match outcome {
			DequeueOutcome::Dequeued(dequeued) => Ok(Some(dequeued)),
			DequeueOutcome::InvalidState { state } => {
				// Outside the lock: system failure takes the lock itself.
				tracing::error!(%run_id, %state, "dequeued run in invalid state");
				self.system_failure(
					run_id,
					RunError::internal(
						InternalErrorCode::TaskDequeuedInvalidState,
						format!("Run was dequeued while its snapshot was {state}"),
					),
				)
				.await?;
				Ok(None)
			}
		}
	}
}

enum DequeueOutcome {
	Dequeued(DequeuedMessage),
	InvalidState { state: String },
}
