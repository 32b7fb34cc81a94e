use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flywheel_types::{AttemptCompletion, CompletedWaitpoint, RetryOptions, RunError};
use flywheel_util::Id;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::client::PlatformClient;

/// Handle the executing task uses to talk back to the platform mid-attempt.
#[derive(Clone)]
pub struct AttemptHandle {
	pub(crate) client: PlatformClient,
	pub(crate) run_id: Id,
	pub(crate) snapshot_id: watch::Receiver<Id>,
}

impl AttemptHandle {
	/// Blocks the run on a datetime waitpoint. The attempt should then await
	/// the waitpoint delivery on [`ExecutionContext::waitpoints`].
	pub async fn wait_until(
		&self,
		date: i64,
	) -> Result<flywheel_runner_protocol::WaitForDurationResponse> {
		let snapshot_id = *self.snapshot_id.borrow();
		self.client.wait_duration(self.run_id, snapshot_id, date).await
	}
}

/// Everything an attempt gets to work with.
pub struct ExecutionContext {
	pub run_id: Id,
	pub friendly_id: String,
	pub attempt_number: u32,
	pub payload: String,
	pub payload_type: String,
	pub env_vars: HashMap<String, String>,
	/// Fired when the platform wants the attempt gone (cancel or suspend).
	pub cancel: CancellationToken,
	/// Waitpoint completions delivered while this attempt is live.
	pub waitpoints: mpsc::UnboundedReceiver<CompletedWaitpoint>,
	pub platform: AttemptHandle,
}

/// User-code boundary. Production runners spawn the task's child process
/// here; tests plug in scripted behaviors.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
	async fn execute(&self, ctx: ExecutionContext) -> Result<AttemptCompletion>;
}

// MARK: Behaviors

/// Succeeds immediately, echoing the payload back as output.
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
	async fn execute(&self, ctx: ExecutionContext) -> Result<AttemptCompletion> {
		Ok(AttemptCompletion::success(ctx.payload))
	}
}

/// Fails with a retryable error the first `n` attempts, then succeeds.
pub struct FailNTimesExecutor {
	failures: u32,
	retry_delay_ms: i64,
	calls: AtomicU32,
}

impl FailNTimesExecutor {
	pub fn new(failures: u32, retry_delay_ms: i64) -> Self {
		FailNTimesExecutor {
			failures,
			retry_delay_ms,
			calls: AtomicU32::new(0),
		}
	}
}

#[async_trait]
impl TaskExecutor for FailNTimesExecutor {
	async fn execute(&self, _ctx: ExecutionContext) -> Result<AttemptCompletion> {
		let call = self.calls.fetch_add(1, Ordering::SeqCst);
		if call < self.failures {
			return Ok(AttemptCompletion::failure(
				RunError::user(format!("scripted failure {}", call + 1)),
				Some(RetryOptions {
					delay_ms: self.retry_delay_ms,
				}),
			));
		}
		Ok(AttemptCompletion::success("\"recovered\""))
	}
}

/// Sleeps in-process until canceled or done. Exercises cancellation and
/// heartbeats without waitpoints.
pub struct SleepExecutor {
	pub duration: Duration,
}

#[async_trait]
impl TaskExecutor for SleepExecutor {
	async fn execute(&self, ctx: ExecutionContext) -> Result<AttemptCompletion> {
		tokio::select! {
			_ = tokio::time::sleep(self.duration) => {
				Ok(AttemptCompletion::success("\"slept\""))
			}
			_ = ctx.cancel.cancelled() => {
				Ok(AttemptCompletion::failure(
					RunError::aborted("attempt canceled while sleeping"),
					None,
				))
			}
		}
	}
}

/// Requests a platform-side duration wait, then awaits the waitpoint
/// delivery. Exercises the block/resume path end to end.
pub struct WaitForDurationExecutor {
	pub wait_ms: i64,
}

#[async_trait]
impl TaskExecutor for WaitForDurationExecutor {
	async fn execute(&self, mut ctx: ExecutionContext) -> Result<AttemptCompletion> {
		let wake_at = flywheel_util::timestamp::now() + self.wait_ms;
		let wait = ctx.platform.wait_until(wake_at).await?;

		tokio::select! {
			delivered = ctx.waitpoints.recv() => {
				match delivered {
					Some(waitpoint) if waitpoint.id == wait.waitpoint_id => {
						Ok(AttemptCompletion::success("\"woke\""))
					}
					Some(other) => Ok(AttemptCompletion::failure(
						RunError::user(format!("unexpected waitpoint {}", other.id)),
						None,
					)),
					None => Ok(AttemptCompletion::failure(
						RunError::user("waitpoint channel closed"),
						None,
					)),
				}
			}
			_ = ctx.cancel.cancelled() => {
				Ok(AttemptCompletion::failure(
					RunError::aborted("attempt canceled while waiting"),
					None,
				))
			}
		}
	}
}
