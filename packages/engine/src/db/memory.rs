use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use flywheel_types::{
	Attempt, Environment, ExecutionSnapshot, Run, RunError, RunStatus, TaskQueue, Waitpoint,
	WaitpointStatus,
};
use flywheel_util::Id;

use crate::db::{CompleteWaitpointOutcome, Database};

/// In-process store for tests and local development. One mutex acquisition
/// per call mirrors the per-call transactions of the Postgres driver.
#[derive(Default)]
pub struct MemoryDatabase {
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	environments: HashMap<Id, Environment>,
	runs: HashMap<Id, Run>,
	/// run id → snapshots, append order.
	snapshots: HashMap<Id, Vec<ExecutionSnapshot>>,
	waitpoints: HashMap<Id, Waitpoint>,
	/// (run id, waitpoint id, project id).
	run_waitpoints: Vec<(Id, Id, Id)>,
	/// run id → attempts, append order.
	attempts: HashMap<Id, Vec<Attempt>>,
	task_queues: HashMap<(Id, String), TaskQueue>,
}

impl MemoryDatabase {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Database for MemoryDatabase {
	async fn upsert_environment(&self, env: &Environment) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state.environments.insert(env.id, env.clone());
		Ok(())
	}

	async fn get_environment(&self, env_id: Id) -> Result<Option<Environment>> {
		let state = self.state.lock().unwrap();
		Ok(state.environments.get(&env_id).cloned())
	}

	async fn create_run(
		&self,
		run: &Run,
		initial_snapshot: &ExecutionSnapshot,
		associated_waitpoint: &Waitpoint,
	) -> Result<()> {
		let mut state = self.state.lock().unwrap();

		if state.runs.contains_key(&run.id) {
			bail!("run {} already exists", run.id);
		}

		state.runs.insert(run.id, run.clone());
		state
			.snapshots
			.entry(run.id)
			.or_default()
			.push(initial_snapshot.clone());
		state
			.waitpoints
			.insert(associated_waitpoint.id, associated_waitpoint.clone());

		Ok(())
	}

	async fn get_run(&self, run_id: Id) -> Result<Option<Run>> {
		let state = self.state.lock().unwrap();
		Ok(state.runs.get(&run_id).cloned())
	}

	async fn find_run_by_idempotency_key(
		&self,
		environment_id: Id,
		idempotency_key: &str,
	) -> Result<Option<Run>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.runs
			.values()
			.find(|run| {
				run.environment_id == environment_id
					&& run.idempotency_key.as_deref() == Some(idempotency_key)
			})
			.cloned())
	}

	async fn update_run_status(&self, run_id: Id, status: RunStatus) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let Some(run) = state.runs.get_mut(&run_id) else {
			bail!("run {run_id} not found");
		};
		run.status = status;
		run.updated_at = flywheel_util::timestamp::now();
		Ok(())
	}

	async fn set_run_result(
		&self,
		run_id: Id,
		status: RunStatus,
		output: Option<String>,
		error: Option<RunError>,
	) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let Some(run) = state.runs.get_mut(&run_id) else {
			bail!("run {run_id} not found");
		};
		run.status = status;
		run.output = output;
		run.error = error;
		run.updated_at = flywheel_util::timestamp::now();
		Ok(())
	}

	async fn set_run_attempt_count(&self, run_id: Id, attempt_count: u32) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let Some(run) = state.runs.get_mut(&run_id) else {
			bail!("run {run_id} not found");
		};
		run.attempt_count = attempt_count;
		run.updated_at = flywheel_util::timestamp::now();
		Ok(())
	}

	async fn insert_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state
			.snapshots
			.entry(snapshot.run_id)
			.or_default()
			.push(snapshot.clone());
		Ok(())
	}

	async fn latest_snapshot(&self, run_id: Id) -> Result<Option<ExecutionSnapshot>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.snapshots
			.get(&run_id)
			.and_then(|snapshots| snapshots.last())
			.cloned())
	}

	async fn list_snapshots(&self, run_id: Id) -> Result<Vec<ExecutionSnapshot>> {
		let state = self.state.lock().unwrap();
		Ok(state.snapshots.get(&run_id).cloned().unwrap_or_default())
	}

	async fn create_waitpoint(&self, waitpoint: &Waitpoint) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state.waitpoints.insert(waitpoint.id, waitpoint.clone());
		Ok(())
	}

	async fn get_waitpoint(&self, waitpoint_id: Id) -> Result<Option<Waitpoint>> {
		let state = self.state.lock().unwrap();
		Ok(state.waitpoints.get(&waitpoint_id).cloned())
	}

	async fn find_waitpoint_by_idempotency_key(
		&self,
		project_id: Id,
		idempotency_key: &str,
	) -> Result<Option<Waitpoint>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.waitpoints
			.values()
			.find(|w| {
				w.project_id == project_id
					&& w.idempotency_key.as_deref() == Some(idempotency_key)
			})
			.cloned())
	}

	async fn block_run_with_waitpoint(
		&self,
		run_id: Id,
		waitpoint_id: Id,
		project_id: Id,
		run_status: RunStatus,
	) -> Result<()> {
		let mut state = self.state.lock().unwrap();

		if !state.waitpoints.contains_key(&waitpoint_id) {
			bail!("waitpoint {waitpoint_id} not found");
		}
		let Some(run) = state.runs.get_mut(&run_id) else {
			bail!("run {run_id} not found");
		};
		run.status = run_status;
		run.updated_at = flywheel_util::timestamp::now();

		let row = (run_id, waitpoint_id, project_id);
		if !state.run_waitpoints.contains(&row) {
			state.run_waitpoints.push(row);
		}

		Ok(())
	}

	async fn complete_waitpoint(
		&self,
		waitpoint_id: Id,
		output: Option<String>,
		output_is_error: bool,
		completed_at: i64,
	) -> Result<CompleteWaitpointOutcome> {
		let mut state = self.state.lock().unwrap();

		let Some(waitpoint) = state.waitpoints.get_mut(&waitpoint_id) else {
			bail!("waitpoint {waitpoint_id} not found");
		};
		// Completed is terminal; never reopen or rewrite the output.
		if waitpoint.status == WaitpointStatus::Completed {
			return Ok(CompleteWaitpointOutcome {
				already_completed: true,
				unblocked: Vec::new(),
			});
		}

		waitpoint.status = WaitpointStatus::Completed;
		waitpoint.output = output;
		waitpoint.output_is_error = output_is_error;
		waitpoint.completed_at = Some(completed_at);

		let blocked_runs = state
			.run_waitpoints
			.iter()
			.filter(|(_, w, _)| *w == waitpoint_id)
			.map(|(run_id, _, _)| *run_id)
			.collect::<Vec<_>>();
		state.run_waitpoints.retain(|(_, w, _)| *w != waitpoint_id);

		let mut unblocked = Vec::new();
		for run_id in blocked_runs {
			let still_blocked = state.run_waitpoints.iter().any(|(r, _, _)| *r == run_id);
			if still_blocked {
				continue;
			}
			let Some(run) = state.runs.get(&run_id) else {
				continue;
			};
			if matches!(
				run.status,
				RunStatus::Pending | RunStatus::WaitingToResume | RunStatus::Delayed
			) {
				unblocked.push(run.clone());
			}
		}

		Ok(CompleteWaitpointOutcome {
			already_completed: false,
			unblocked,
		})
	}

	async fn blocking_waitpoint_count(&self, run_id: Id) -> Result<u64> {
		let state = self.state.lock().unwrap();
		Ok(state
			.run_waitpoints
			.iter()
			.filter(|(r, _, _)| *r == run_id)
			.count() as u64)
	}

	async fn list_stale_waiting_runs(&self, older_than: i64, limit: usize) -> Result<Vec<Run>> {
		let state = self.state.lock().unwrap();
		let mut stale = state
			.runs
			.values()
			.filter(|run| run.status == RunStatus::WaitingToResume && run.updated_at < older_than)
			.cloned()
			.collect::<Vec<_>>();
		stale.sort_by_key(|run| run.updated_at);
		stale.truncate(limit);
		Ok(stale)
	}

	async fn create_attempt(&self, attempt: &Attempt) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state
			.attempts
			.entry(attempt.run_id)
			.or_default()
			.push(attempt.clone());
		Ok(())
	}

	async fn latest_attempt(&self, run_id: Id) -> Result<Option<Attempt>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.attempts
			.get(&run_id)
			.and_then(|attempts| attempts.last())
			.cloned())
	}

	async fn complete_attempt(
		&self,
		attempt_id: Id,
		completed_at: i64,
		error: Option<RunError>,
	) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		for attempts in state.attempts.values_mut() {
			if let Some(attempt) = attempts.iter_mut().find(|a| a.id == attempt_id) {
				attempt.completed_at = Some(completed_at);
				attempt.error = error;
				return Ok(());
			}
		}
		bail!("attempt {attempt_id} not found");
	}

	async fn upsert_task_queue(&self, queue: &TaskQueue) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state
			.task_queues
			.insert((queue.environment_id, queue.name.clone()), queue.clone());
		Ok(())
	}

	async fn get_task_queue(&self, environment_id: Id, name: &str) -> Result<Option<TaskQueue>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.task_queues
			.get(&(environment_id, name.to_string()))
			.cloned())
	}
}
