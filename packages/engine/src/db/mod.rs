use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use flywheel_types::{
	Attempt, Environment, ExecutionSnapshot, Run, RunError, RunStatus, TaskQueue, Waitpoint,
};
use flywheel_util::Id;

pub mod memory;
pub mod postgres;

pub type DatabaseHandle = Arc<dyn Database>;

/// Runs that became fully unblocked by a waitpoint completion.
#[derive(Debug, Default)]
pub struct CompleteWaitpointOutcome {
	pub already_completed: bool,
	/// Runs with no remaining blocking waitpoints and a resumable status.
	pub unblocked: Vec<Run>,
}

/// Relational store behind the engine. Methods are domain-level and atomic;
/// the Postgres driver wraps each in a transaction, the memory driver in a
/// single lock acquisition.
#[async_trait]
pub trait Database: Send + Sync {
	// MARK: Environments
	async fn upsert_environment(&self, env: &Environment) -> Result<()>;
	async fn get_environment(&self, env_id: Id) -> Result<Option<Environment>>;

	// MARK: Runs
	/// Creates the run, its initial snapshot, and its associated run-type
	/// waitpoint in one transaction.
	async fn create_run(
		&self,
		run: &Run,
		initial_snapshot: &ExecutionSnapshot,
		associated_waitpoint: &Waitpoint,
	) -> Result<()>;
	async fn get_run(&self, run_id: Id) -> Result<Option<Run>>;
	async fn find_run_by_idempotency_key(
		&self,
		environment_id: Id,
		idempotency_key: &str,
	) -> Result<Option<Run>>;
	async fn update_run_status(&self, run_id: Id, status: RunStatus) -> Result<()>;
	async fn set_run_result(
		&self,
		run_id: Id,
		status: RunStatus,
		output: Option<String>,
		error: Option<RunError>,
	) -> Result<()>;
	async fn set_run_attempt_count(&self, run_id: Id, attempt_count: u32) -> Result<()>;

	// MARK: Snapshots
	/// Append-only; the driver must reject mutation of existing snapshots by
	/// construction (inserts only).
	async fn insert_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<()>;
	async fn latest_snapshot(&self, run_id: Id) -> Result<Option<ExecutionSnapshot>>;
	async fn list_snapshots(&self, run_id: Id) -> Result<Vec<ExecutionSnapshot>>;

	// MARK: Waitpoints
	async fn create_waitpoint(&self, waitpoint: &Waitpoint) -> Result<()>;
	async fn get_waitpoint(&self, waitpoint_id: Id) -> Result<Option<Waitpoint>>;
	async fn find_waitpoint_by_idempotency_key(
		&self,
		project_id: Id,
		idempotency_key: &str,
	) -> Result<Option<Waitpoint>>;
	/// Inserts the RunWaitpoint join row and moves the run to the given
	/// status in one transaction.
	async fn block_run_with_waitpoint(
		&self,
		run_id: Id,
		waitpoint_id: Id,
		project_id: Id,
		run_status: RunStatus,
	) -> Result<()>;
	/// The waitpoint completion transaction: no-op when already completed,
	/// otherwise deletes
	/// all join rows, marks the waitpoint completed, and reports which runs
	/// now have no blocking waitpoints and a resumable status.
	async fn complete_waitpoint(
		&self,
		waitpoint_id: Id,
		output: Option<String>,
		output_is_error: bool,
		completed_at: i64,
	) -> Result<CompleteWaitpointOutcome>;
	async fn blocking_waitpoint_count(&self, run_id: Id) -> Result<u64>;
	/// Lost-wakeup scanner support: waiting-to-resume runs whose latest
	/// update is older than the threshold.
	async fn list_stale_waiting_runs(&self, older_than: i64, limit: usize) -> Result<Vec<Run>>;

	// MARK: Attempts
	async fn create_attempt(&self, attempt: &Attempt) -> Result<()>;
	async fn latest_attempt(&self, run_id: Id) -> Result<Option<Attempt>>;
	async fn complete_attempt(
		&self,
		attempt_id: Id,
		completed_at: i64,
		error: Option<RunError>,
	) -> Result<()>;

	// MARK: Task queues
	async fn upsert_task_queue(&self, queue: &TaskQueue) -> Result<()>;
	async fn get_task_queue(&self, environment_id: Id, name: &str) -> Result<Option<TaskQueue>>;
}
