use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::driver::TimerDriverHandle;
use crate::job::{RegistryHandle, TimerJob};

/// Cap on the nack backoff exponent.
const MAX_RETRY_EXPONENT: u32 = 8;

/// Polls the timer store for due jobs and dispatches them to registered
/// handlers. Multiple workers may share one store; the visibility-timeout
/// pull keeps them from double-delivering within the window, and handlers
/// are idempotent beyond it.
pub struct Worker {
	worker_id: String,
	registry: RegistryHandle,
	driver: TimerDriverHandle,
	config: flywheel_config::Config,
}

impl Worker {
	pub fn new(
		config: flywheel_config::Config,
		registry: RegistryHandle,
		driver: TimerDriverHandle,
	) -> Self {
		Worker {
			worker_id: flywheel_util::id::friendly_id("worker", flywheel_util::Id::new()),
			registry,
			driver,
			config,
		}
	}

	/// Runs until the shutdown channel fires. Provide `None` to run until
	/// dropped.
	#[tracing::instrument(skip_all, fields(worker_id=%self.worker_id))]
	pub async fn start(self, mut shutdown_rx: Option<watch::Receiver<()>>) -> Result<()> {
		tracing::debug!(
			registered_handlers = self.registry.size(),
			"started delayed-job worker"
		);

		let mut tick_interval =
			tokio::time::interval(Duration::from_millis(self.config.worker().poll_interval_ms() as u64));
		tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			let shutdown_fut = async {
				if let Some(shutdown_rx) = &mut shutdown_rx {
					shutdown_rx.changed().await
				} else {
					std::future::pending().await
				}
			};

			tokio::select! {
				_ = tick_interval.tick() => {}
				res = shutdown_fut => {
					if res.is_err() {
						tracing::debug!("shutdown channel dropped, ignoring");
						shutdown_rx = None;
					} else {
						break;
					}
				}
			}

			if let Err(err) = self.tick().await {
				tracing::error!(?err, "delayed-job tick errored");
			}
		}

		tracing::info!("delayed-job worker shutdown complete");

		Ok(())
	}

	/// One poll pass: pull due jobs, run their handlers, ack or nack.
	/// Returns how many jobs were processed.
	#[tracing::instrument(skip_all)]
	pub async fn tick(&self) -> Result<usize> {
		let worker_config = self.config.worker();
		let now = flywheel_util::timestamp::now();

		let jobs = self
			.driver
			.pull(
				now,
				worker_config.visibility_timeout_ms(),
				worker_config.batch_size(),
			)
			.await?;
		if jobs.is_empty() {
			return Ok(0);
		}

		let count = jobs.len();
		let mut join_set = JoinSet::new();
		for job in jobs {
			let registry = self.registry.clone();
			let driver = self.driver.clone();
			let retry_base = worker_config.retry_base_delay_ms();

			join_set.spawn(async move {
				run_job(registry, driver, job, retry_base).await;
			});
		}
		while join_set.join_next().await.is_some() {}

		Ok(count)
	}
}

#[tracing::instrument(skip_all, fields(job_id=%job.id, kind=%job.kind, attempts=job.attempts))]
async fn run_job(
	registry: RegistryHandle,
	driver: TimerDriverHandle,
	job: TimerJob,
	retry_base_ms: i64,
) {
	let Some(handler) = registry.get(&job.kind) else {
		tracing::warn!("no handler registered for job kind, dropping");
		if let Err(err) = driver.ack(&job.id).await {
			tracing::error!(?err, "failed acking unhandled job");
		}
		return;
	};

	match handler.handle(job.payload.clone()).await {
		Ok(()) => {
			if let Err(err) = driver.ack(&job.id).await {
				tracing::error!(?err, "failed acking job");
			}
		}
		Err(err) => {
			let exponent = (job.attempts.saturating_sub(1)).min(MAX_RETRY_EXPONENT);
			let retry_at =
				flywheel_util::timestamp::now() + retry_base_ms * 2i64.pow(exponent);
			tracing::warn!(?err, retry_at, "job handler failed, rescheduling");
			if let Err(err) = driver.nack(&job.id, retry_at).await {
				tracing::error!(?err, "failed nacking job");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicU32, Ordering};

	use anyhow::{Result, bail};
	use async_trait::async_trait;

	use super::*;
	use crate::driver::memory::MemoryTimerDriver;
	use crate::job::{JobHandler, Registry, TimerJob};

	struct CountingHandler {
		calls: AtomicU32,
		fail_first: bool,
	}

	#[async_trait]
	impl JobHandler for CountingHandler {
		fn kind(&self) -> &'static str {
			"counting"
		}

		async fn handle(&self, _payload: serde_json::Value) -> Result<()> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail_first && call == 0 {
				bail!("transient failure");
			}
			Ok(())
		}
	}

	fn test_worker(handler: Arc<CountingHandler>) -> (Worker, TimerDriverHandle) {
		let mut registry = Registry::new();
		registry.register(handler).unwrap();
		let driver: TimerDriverHandle = Arc::new(MemoryTimerDriver::new());
		let config = flywheel_config::Config::from_root(Default::default());
		(
			Worker::new(config, Arc::new(registry), driver.clone()),
			driver,
		)
	}

	#[tokio::test]
	async fn due_job_fires_once() {
		let handler = Arc::new(CountingHandler {
			calls: AtomicU32::new(0),
			fail_first: false,
		});
		let (worker, driver) = test_worker(handler.clone());

		driver
			.enqueue(&TimerJob::new(
				"job-1",
				"counting",
				serde_json::json!({}),
				flywheel_util::timestamp::now(),
			))
			.await
			.unwrap();

		assert_eq!(worker.tick().await.unwrap(), 1);
		assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

		// Acked; a second tick finds nothing.
		assert_eq!(worker.tick().await.unwrap(), 0);
		assert_eq!(driver.len().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn future_job_does_not_fire_early() {
		let handler = Arc::new(CountingHandler {
			calls: AtomicU32::new(0),
			fail_first: false,
		});
		let (worker, driver) = test_worker(handler.clone());

		driver
			.enqueue(&TimerJob::new(
				"job-1",
				"counting",
				serde_json::json!({}),
				flywheel_util::timestamp::now() + 60_000,
			))
			.await
			.unwrap();

		assert_eq!(worker.tick().await.unwrap(), 0);
		assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn duplicate_ids_collapse() {
		let handler = Arc::new(CountingHandler {
			calls: AtomicU32::new(0),
			fail_first: false,
		});
		let (worker, driver) = test_worker(handler.clone());

		let now = flywheel_util::timestamp::now();
		for _ in 0..3 {
			driver
				.enqueue(&TimerJob::new(
					"heartbeatSnapshot.abc",
					"counting",
					serde_json::json!({}),
					now,
				))
				.await
				.unwrap();
		}

		assert_eq!(worker.tick().await.unwrap(), 1);
		assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failed_job_is_rescheduled_with_backoff() {
		let handler = Arc::new(CountingHandler {
			calls: AtomicU32::new(0),
			fail_first: true,
		});
		let (worker, driver) = test_worker(handler.clone());

		driver
			.enqueue(&TimerJob::new(
				"job-1",
				"counting",
				serde_json::json!({}),
				flywheel_util::timestamp::now(),
			))
			.await
			.unwrap();

		assert_eq!(worker.tick().await.unwrap(), 1);
		assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
		// Still present, scheduled for the retry.
		assert_eq!(driver.len().await.unwrap(), 1);
	}
}
