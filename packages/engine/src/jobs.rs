use anyhow::{Context, Result};
use async_trait::async_trait;
use flywheel_util::Id;
use ratchet::{JobHandler, Registry, TimerJob};
use serde::Deserialize;

use crate::engine::Engine;

pub const EXPIRE_RUN: &str = "expireRun";
pub const WAITPOINT_COMPLETE_DATE_TIME: &str = "waitpointCompleteDateTime";
pub const HEARTBEAT_SNAPSHOT: &str = "heartbeatSnapshot";
pub const WAITING_TO_RESUME_SCAN: &str = "waitingToResumeScan";

impl Engine {
	/// Wires the engine's delayed-job handlers into a worker registry.
	pub fn register_job_handlers(&self, registry: &mut Registry) -> Result<()> {
		registry.register(std::sync::Arc::new(ExpireRunHandler {
			engine: self.clone(),
		}))?;
		registry.register(std::sync::Arc::new(WaitpointCompleteDateTimeHandler {
			engine: self.clone(),
		}))?;
		registry.register(std::sync::Arc::new(HeartbeatSnapshotHandler {
			engine: self.clone(),
		}))?;
		registry.register(std::sync::Arc::new(WaitingToResumeScanHandler {
			engine: self.clone(),
		}))?;
		Ok(())
	}

	/// Seeds the self-rescheduling maintenance timers. Safe to call from
	/// every process; deterministic ids collapse the duplicates.
	pub async fn schedule_maintenance_jobs(&self) -> Result<()> {
		self.timers
			.enqueue(&TimerJob::new(
				WAITING_TO_RESUME_SCAN,
				WAITING_TO_RESUME_SCAN,
				serde_json::json!({}),
				flywheel_util::timestamp::now() + self.config.engine().resume_scan_interval_ms(),
			))
			.await
	}
}

#[derive(Deserialize)]
struct RunPayload {
	run_id: Id,
}

#[derive(Deserialize)]
struct WaitpointPayload {
	waitpoint_id: Id,
}

#[derive(Deserialize)]
struct SnapshotPayload {
	run_id: Id,
	snapshot_id: Id,
}

struct ExpireRunHandler {
	engine: Engine,
}

#[async_trait]
impl JobHandler for ExpireRunHandler {
	fn kind(&self) -> &'static str {
		EXPIRE_RUN
	}

	async fn handle(&self, payload: serde_json::Value) -> Result<()> {
		let payload =
			serde_json::from_value::<RunPayload>(payload).context("invalid expireRun payload")?;
		self.engine.expire(payload.run_id).await
	}
}

struct WaitpointCompleteDateTimeHandler {
	engine: Engine,
}

#[async_trait]
impl JobHandler for WaitpointCompleteDateTimeHandler {
	fn kind(&self) -> &'static str {
		WAITPOINT_COMPLETE_DATE_TIME
	}

	async fn handle(&self, payload: serde_json::Value) -> Result<()> {
		let payload = serde_json::from_value::<WaitpointPayload>(payload)
			.context("invalid waitpointCompleteDateTime payload")?;
		self.engine
			.complete_waitpoint(payload.waitpoint_id, None, false)
			.await
	}
}

struct HeartbeatSnapshotHandler {
	engine: Engine,
}

#[async_trait]
impl JobHandler for HeartbeatSnapshotHandler {
	fn kind(&self) -> &'static str {
		HEARTBEAT_SNAPSHOT
	}

	async fn handle(&self, payload: serde_json::Value) -> Result<()> {
		let payload = serde_json::from_value::<SnapshotPayload>(payload)
			.context("invalid heartbeatSnapshot payload")?;
		self.engine
			.handle_stalled_snapshot(payload.run_id, payload.snapshot_id)
			.await
	}
}

struct WaitingToResumeScanHandler {
	engine: Engine,
}

#[async_trait]
impl JobHandler for WaitingToResumeScanHandler {
	fn kind(&self) -> &'static str {
		WAITING_TO_RESUME_SCAN
	}

	async fn handle(&self, _payload: serde_json::Value) -> Result<()> {
		let repaired = self.engine.scan_waiting_runs().await?;
		if repaired > 0 {
			tracing::info!(repaired, "resume scan repaired lost wakeups");
		}

		// Self-rescheduling: the scan is a permanent heartbeat of the
		// system.
		self.engine.schedule_maintenance_jobs().await
	}
}
