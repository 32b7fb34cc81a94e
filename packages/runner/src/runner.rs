use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use flywheel_runner_protocol::{
	DequeuedMessage, RunExecutionData, StartAttemptRequest, StartAttemptResponse,
	WorkloadClientMessage, WorkloadServerMessage,
};
use flywheel_types::{AttemptCompletion, AttemptStatus, ExecutionStatus, RunError};
use flywheel_util::Id;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, PlatformClient};
use crate::config::RunnerConfig;
use crate::executor::{AttemptHandle, ExecutionContext, TaskExecutor};

/// How an attempt's supervision ended.
enum AttemptOutcome {
	/// The executor returned a completion to submit.
	Completed(AttemptCompletion),
	/// The platform suspended us; the child is gone, warm-start next.
	Suspended,
	/// The run finished or was taken away externally; nothing to submit.
	Abandoned,
}

/// Single-threaded cooperative runner: one attempt in flight, all protocol
/// reactions serialised through one handler.
pub struct Runner {
	config: RunnerConfig,
	client: PlatformClient,
	executor: Arc<dyn TaskExecutor>,
	warm_start_count: u32,
}

impl Runner {
	pub fn new(config: RunnerConfig, executor: Arc<dyn TaskExecutor>) -> Result<Self> {
		Ok(Runner {
			client: PlatformClient::new(config.clone())?,
			config,
			executor,
			warm_start_count: 0,
		})
	}

	/// Warm-start loop: long-poll for work until the total duration elapses
	/// with nothing to do.
	#[tracing::instrument(skip_all, fields(runner_id=%self.config.runner_id))]
	pub async fn start(&mut self) -> Result<()> {
		tracing::info!("runner started");
		let mut idle_since = Instant::now();
		let total_duration = Duration::from_millis(self.config.total_duration_ms as u64);

		loop {
			match self.client.warm_start().await {
				Ok(Some(message)) => {
					if let Err(err) = self.run(message).await {
						tracing::error!(?err, "run supervision failed");
					}
					self.warm_start_count += 1;
					idle_since = Instant::now();
				}
				Ok(None) => {
					if idle_since.elapsed() >= total_duration {
						tracing::info!("no work within total duration, exiting");
						return Ok(());
					}
				}
				Err(err) => {
					tracing::warn!(?err, "warm-start poll failed");
					tokio::time::sleep(Duration::from_millis(1_000)).await;
				}
			}
		}
	}

	/// Supervises one dequeued run through all of its local attempts.
	#[tracing::instrument(skip_all, fields(run_id=%message.run_id))]
	async fn run(&self, message: DequeuedMessage) -> Result<()> {
		let run_id = message.run_id;
		let mut snapshot_id = message.snapshot_id;
		let mut expected_attempt: Option<u32> = None;

		loop {
			let started = match self
				.client
				.start_attempt(
					run_id,
					snapshot_id,
					StartAttemptRequest {
						is_warm_start: self.warm_start_count > 0,
						warm_start_count: self.warm_start_count,
					},
				)
				.await
			{
				Ok(started) => started,
				Err(err) if err.downcast_ref::<ClientError>().is_some() => {
					// Stale snapshot or vanished run: fatal for this
					// attempt, back to warm start.
					tracing::warn!(?err, "could not start attempt");
					return Ok(());
				}
				Err(err) => return Err(err),
			};

			// Attempt-number invariant: a platform that disagrees with what
			// we expect has moved on without us.
			if let Some(expected) = expected_attempt {
				if started.attempt_number != expected {
					tracing::warn!(
						expected,
						actual = started.attempt_number,
						"attempt number mismatch, abandoning run"
					);
					return Ok(());
				}
			}

			let outcome = self.supervise_attempt(&message, &started).await?;
			let completion = match outcome {
				AttemptOutcome::Completed(completion) => completion,
				AttemptOutcome::Suspended => {
					tracing::info!("suspended, returning to warm start");
					return Ok(());
				}
				AttemptOutcome::Abandoned => {
					tracing::info!("run taken away, returning to warm start");
					return Ok(());
				}
			};

			let latest = self.client.execution_data(run_id).await?;
			let response = match self
				.client
				.complete(run_id, latest.snapshot.id, completion)
				.await
			{
				Ok(response) => response,
				Err(err) if err.downcast_ref::<ClientError>().is_some() => {
					tracing::warn!(?err, "could not submit completion");
					return Ok(());
				}
				Err(err) => return Err(err),
			};

			match response.attempt_status {
				AttemptStatus::RunFinished | AttemptStatus::RetryQueued => return Ok(()),
				AttemptStatus::RetryImmediately => {
					let delay = response.retry_delay_ms.unwrap_or(0);
					tracing::info!(delay, "retrying attempt in place");
					tokio::time::sleep(Duration::from_millis(delay as u64)).await;
					snapshot_id = response.snapshot.id;
					expected_attempt = Some(started.attempt_number + 1);
				}
				AttemptStatus::RunPendingCancel => {
					// A cancel raced our completion; acknowledge it with an
					// aborted result.
					self.client
						.complete(
							run_id,
							response.snapshot.id,
							AttemptCompletion::failure(
								RunError::aborted("attempt aborted by cancel"),
								None,
							),
						)
						.await?;
					return Ok(());
				}
			}
		}
	}

	/// Runs the executor alongside the heartbeat, the snapshot poll, and
	/// (optionally) the notify socket, reacting to every snapshot change.
	async fn supervise_attempt(
		&self,
		message: &DequeuedMessage,
		started: &StartAttemptResponse,
	) -> Result<AttemptOutcome> {
		let run_id = message.run_id;
		let (snapshot_tx, snapshot_rx) = watch::channel(started.snapshot.id);
		let (waitpoint_tx, waitpoint_rx) = mpsc::unbounded_channel();
		let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RunExecutionData>();
		let cancel = CancellationToken::new();

		let ctx = ExecutionContext {
			run_id,
			friendly_id: message.friendly_id.clone(),
			attempt_number: started.attempt_number,
			payload: message.payload.clone(),
			payload_type: message.payload_type.clone(),
			env_vars: started.env_vars.clone(),
			cancel: cancel.clone(),
			waitpoints: waitpoint_rx,
			platform: AttemptHandle {
				client: self.client.clone(),
				run_id,
				snapshot_id: snapshot_rx.clone(),
			},
		};

		let executor = self.executor.clone();
		let mut executor_handle = tokio::spawn(async move { executor.execute(ctx).await });

		let heartbeat_handle = self.spawn_heartbeat(run_id, snapshot_rx.clone());
		let poll_handle = self.spawn_snapshot_poll(run_id, event_tx.clone());
		let notify_handle = if self.config.use_notify_socket {
			Some(self.spawn_notify_socket(run_id, event_tx.clone()))
		} else {
			None
		};

		// Reactions are serialised: ws pushes and poll results funnel into
		// one channel, and this mutex guards the handler against any future
		// second producer driving it directly.
		let handler_mutex = Mutex::new(());
		let mut seen_snapshot = started.snapshot.id;

		let outcome = loop {
			tokio::select! {
				exec_result = &mut executor_handle => {
					let completion = match exec_result {
						Ok(Ok(completion)) => completion,
						Ok(Err(err)) => AttemptCompletion::failure(
							RunError::user(format!("executor error: {err:#}")),
							None,
						),
						Err(err) => AttemptCompletion::failure(
							RunError::user(format!("executor panicked: {err}")),
							None,
						),
					};
					break AttemptOutcome::Completed(completion);
				}
				event = event_rx.recv() => {
					let Some(data) = event else {
						break AttemptOutcome::Abandoned;
					};
					let _guard = handler_mutex.lock().await;

					if data.snapshot.id == seen_snapshot {
						continue;
					}
					seen_snapshot = data.snapshot.id;
					let _ = snapshot_tx.send(data.snapshot.id);

					match self
						.handle_snapshot_change(run_id, &data, &cancel, &waitpoint_tx)
						.await?
					{
						Some(outcome) => break outcome,
						None => continue,
					}
				}
			}
		};

		heartbeat_handle.abort();
		poll_handle.abort();
		if let Some(notify_handle) = notify_handle {
			notify_handle.abort();
		}
		if !matches!(outcome, AttemptOutcome::Completed(_)) {
			executor_handle.abort();
		}

		Ok(outcome)
	}

	/// Reaction table keyed by the new execution status.
	async fn handle_snapshot_change(
		&self,
		run_id: Id,
		data: &RunExecutionData,
		cancel: &CancellationToken,
		waitpoint_tx: &mpsc::UnboundedSender<flywheel_types::CompletedWaitpoint>,
	) -> Result<Option<AttemptOutcome>> {
		tracing::debug!(
			snapshot_id=%data.snapshot.id,
			execution_status=%data.snapshot.execution_status,
			"observed snapshot change"
		);

		match data.snapshot.execution_status {
			ExecutionStatus::PendingCancel => {
				cancel.cancel();
				Ok(None)
			}
			ExecutionStatus::ExecutingWithWaitpoints => {
				if self.config.suspend_on_wait {
					let response = self.client.suspend(run_id, data.snapshot.id).await?;
					if !response.ok {
						tracing::debug!("suspension declined, staying alive");
					}
				}
				Ok(None)
			}
			ExecutionStatus::Suspended => {
				// Child process goes away; the platform owns the run now.
				cancel.cancel();
				Ok(Some(AttemptOutcome::Suspended))
			}
			ExecutionStatus::PendingExecuting => {
				let continued = self
					.client
					.continue_execution(run_id, data.snapshot.id)
					.await?;
				for waitpoint in continued.completed_waitpoints {
					let _ = waitpoint_tx.send(waitpoint);
				}
				Ok(None)
			}
			ExecutionStatus::Executing => {
				for waitpoint in data.completed_waitpoints.clone() {
					let _ = waitpoint_tx.send(waitpoint);
				}
				Ok(None)
			}
			ExecutionStatus::Finished => Ok(Some(AttemptOutcome::Abandoned)),
			_ => Ok(None),
		}
	}

	fn spawn_heartbeat(&self, run_id: Id, snapshot_rx: watch::Receiver<Id>) -> JoinHandle<()> {
		let client = self.client.clone();
		let interval_ms = self.config.heartbeat_interval_ms as u64;

		tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			// The immediate first tick would double up with attempt start.
			interval.tick().await;

			loop {
				interval.tick().await;
				let snapshot_id = *snapshot_rx.borrow();
				if let Err(err) = client.heartbeat(run_id, snapshot_id).await {
					tracing::debug!(?err, "heartbeat failed");
				}
			}
		})
	}

	fn spawn_snapshot_poll(
		&self,
		run_id: Id,
		event_tx: mpsc::UnboundedSender<RunExecutionData>,
	) -> JoinHandle<()> {
		let client = self.client.clone();
		let interval_ms = self.config.snapshot_poll_interval_ms as u64;

		tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			interval.tick().await;

			loop {
				interval.tick().await;
				match client.execution_data(run_id).await {
					Ok(data) => {
						if event_tx.send(data).is_err() {
							break;
						}
					}
					Err(err) => {
						tracing::debug!(?err, "snapshot poll failed");
					}
				}
			}
		})
	}

	/// Workload socket: subscribe to the run's room and translate notifies
	/// into fresh execution-data events on the shared channel.
	fn spawn_notify_socket(
		&self,
		run_id: Id,
		event_tx: mpsc::UnboundedSender<RunExecutionData>,
	) -> JoinHandle<()> {
		let client = self.client.clone();
		let url = client.workload_url();

		tokio::spawn(async move {
			let (mut socket, _) = match tokio_tungstenite::connect_async(&url).await {
				Ok(connected) => connected,
				Err(err) => {
					tracing::warn!(?err, "workload socket connect failed, poll only");
					return;
				}
			};

			let subscribe = WorkloadClientMessage::Subscribe { run_id };
			let Ok(payload) = serde_json::to_string(&subscribe) else {
				return;
			};
			if socket.send(WsMessage::Text(payload)).await.is_err() {
				return;
			}

			while let Some(message) = socket.next().await {
				let Ok(WsMessage::Text(text)) = message else {
					continue;
				};
				let Ok(WorkloadServerMessage::Notify { run_id: notified }) =
					serde_json::from_str(&text)
				else {
					continue;
				};
				if notified != run_id {
					continue;
				}

				// The notify only says "something changed"; fetch the
				// authoritative state.
				match client.execution_data(run_id).await {
					Ok(data) => {
						if event_tx.send(data).is_err() {
							break;
						}
					}
					Err(err) => {
						tracing::debug!(?err, "post-notify fetch failed");
					}
				}
			}
		})
	}
}
