use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flywheel_types::{
	Attempt, Environment, EnvironmentType, ExecutionSnapshot, ExecutionStatus, Run, RunError,
	RunStatus, TaskQueue, TaskQueueKind, Waitpoint, WaitpointKind, WaitpointStatus,
};
use flywheel_util::Id;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use crate::db::{CompleteWaitpointOutcome, Database};

const SCHEMA: &str = include_str!("../../schema.sql");

pub struct PostgresDatabase {
	pool: flywheel_pools::PgPool,
}

impl PostgresDatabase {
	pub fn new(pool: flywheel_pools::PgPool) -> Self {
		PostgresDatabase { pool }
	}

	/// Applies the schema. Statements are idempotent, so this runs on every
	/// boot.
	#[tracing::instrument(skip_all)]
	pub async fn init(&self) -> Result<()> {
		sqlx::raw_sql(SCHEMA)
			.execute(&self.pool)
			.await
			.context("failed applying schema")?;
		Ok(())
	}
}

fn run_from_row(row: &PgRow) -> Result<Run> {
	let tags: serde_json::Value = row.try_get("tags")?;
	let error: Option<serde_json::Value> = row.try_get("error")?;

	Ok(Run {
		id: row.try_get::<Uuid, _>("id")?.into(),
		friendly_id: row.try_get("friendly_id")?,
		status: RunStatus::from_str(row.try_get::<String, _>("status")?.as_str())
			.context("invalid run status in row")?,
		task_identifier: row.try_get("task_identifier")?,
		payload: row.try_get("payload")?,
		payload_type: row.try_get("payload_type")?,
		organization_id: row.try_get::<Uuid, _>("organization_id")?.into(),
		project_id: row.try_get::<Uuid, _>("project_id")?.into(),
		environment_id: row.try_get::<Uuid, _>("environment_id")?.into(),
		environment_type: EnvironmentType::from_str(
			row.try_get::<String, _>("environment_type")?.as_str(),
		)
		.context("invalid environment type in row")?,
		queue_name: row.try_get("queue_name")?,
		master_queue: row.try_get("master_queue")?,
		concurrency_key: row.try_get("concurrency_key")?,
		idempotency_key: row.try_get("idempotency_key")?,
		max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
		attempt_count: row.try_get::<i32, _>("attempt_count")? as u32,
		priority_ms: row.try_get("priority_ms")?,
		ttl_ms: row.try_get("ttl_ms")?,
		delay_until: row.try_get("delay_until")?,
		tags: serde_json::from_value(tags).context("invalid tags in row")?,
		parent_run_id: row.try_get::<Option<Uuid>, _>("parent_run_id")?.map(Into::into),
		parent_attempt_id: row
			.try_get::<Option<Uuid>, _>("parent_attempt_id")?
			.map(Into::into),
		root_run_id: row.try_get::<Option<Uuid>, _>("root_run_id")?.map(Into::into),
		batch_id: row.try_get::<Option<Uuid>, _>("batch_id")?.map(Into::into),
		depth: row.try_get::<i32, _>("depth")? as u32,
		resume_parent_on_completion: row.try_get("resume_parent_on_completion")?,
		associated_waitpoint_id: row
			.try_get::<Option<Uuid>, _>("associated_waitpoint_id")?
			.map(Into::into),
		trace_context: row.try_get("trace_context")?,
		output: row.try_get("output")?,
		error: error
			.map(serde_json::from_value::<RunError>)
			.transpose()
			.context("invalid error in row")?,
		created_at: row.try_get("created_at")?,
		updated_at: row.try_get("updated_at")?,
	})
}

fn snapshot_from_row(row: &PgRow) -> Result<ExecutionSnapshot> {
	let completed: serde_json::Value = row.try_get("completed_waitpoint_ids")?;

	Ok(ExecutionSnapshot {
		id: row.try_get::<Uuid, _>("id")?.into(),
		run_id: row.try_get::<Uuid, _>("run_id")?.into(),
		execution_status: ExecutionStatus::from_str(
			row.try_get::<String, _>("execution_status")?.as_str(),
		)
		.context("invalid execution status in row")?,
		run_status: RunStatus::from_str(row.try_get::<String, _>("run_status")?.as_str())
			.context("invalid run status in row")?,
		description: row.try_get("description")?,
		worker_id: row.try_get("worker_id")?,
		attempt_number: row.try_get::<i32, _>("attempt_number")? as u32,
		completed_waitpoint_ids: serde_json::from_value(completed)
			.context("invalid waitpoint ids in row")?,
		created_at: row.try_get("created_at")?,
	})
}

fn waitpoint_from_row(row: &PgRow) -> Result<Waitpoint> {
	Ok(Waitpoint {
		id: row.try_get::<Uuid, _>("id")?.into(),
		project_id: row.try_get::<Uuid, _>("project_id")?.into(),
		kind: WaitpointKind::from_str(row.try_get::<String, _>("kind")?.as_str())
			.context("invalid waitpoint kind in row")?,
		status: WaitpointStatus::from_str(row.try_get::<String, _>("status")?.as_str())
			.context("invalid waitpoint status in row")?,
		completed_after: row.try_get("completed_after")?,
		completed_by_run_id: row
			.try_get::<Option<Uuid>, _>("completed_by_run_id")?
			.map(Into::into),
		idempotency_key: row.try_get("idempotency_key")?,
		output: row.try_get("output")?,
		output_is_error: row.try_get("output_is_error")?,
		created_at: row.try_get("created_at")?,
		completed_at: row.try_get("completed_at")?,
	})
}

fn attempt_from_row(row: &PgRow) -> Result<Attempt> {
	let error: Option<serde_json::Value> = row.try_get("error")?;

	Ok(Attempt {
		id: row.try_get::<Uuid, _>("id")?.into(),
		run_id: row.try_get::<Uuid, _>("run_id")?.into(),
		number: row.try_get::<i32, _>("number")? as u32,
		worker_id: row.try_get("worker_id")?,
		started_at: row.try_get("started_at")?,
		completed_at: row.try_get("completed_at")?,
		error: error
			.map(serde_json::from_value::<RunError>)
			.transpose()
			.context("invalid error in row")?,
	})
}

async fn insert_snapshot_tx<'a, E>(executor: E, snapshot: &ExecutionSnapshot) -> Result<()>
where
	E: sqlx::PgExecutor<'a>,
{
	sqlx::query(
		"INSERT INTO execution_snapshots \
		 (id, run_id, execution_status, run_status, description, worker_id, attempt_number, \
		  completed_waitpoint_ids, created_at) \
		 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
	)
	.bind(snapshot.id.as_uuid())
	.bind(snapshot.run_id.as_uuid())
	.bind(snapshot.execution_status.to_string())
	.bind(snapshot.run_status.to_string())
	.bind(&snapshot.description)
	.bind(&snapshot.worker_id)
	.bind(snapshot.attempt_number as i32)
	.bind(serde_json::to_value(&snapshot.completed_waitpoint_ids)?)
	.bind(snapshot.created_at)
	.execute(executor)
	.await
	.context("failed inserting snapshot")?;
	Ok(())
}

async fn insert_waitpoint_tx<'a, E>(executor: E, waitpoint: &Waitpoint) -> Result<()>
where
	E: sqlx::PgExecutor<'a>,
{
	sqlx::query(
		"INSERT INTO waitpoints \
		 (id, project_id, kind, status, completed_after, completed_by_run_id, idempotency_key, \
		  output, output_is_error, created_at, completed_at) \
		 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
	)
	.bind(waitpoint.id.as_uuid())
	.bind(waitpoint.project_id.as_uuid())
	.bind(waitpoint.kind.to_string())
	.bind(waitpoint.status.to_string())
	.bind(waitpoint.completed_after)
	.bind(waitpoint.completed_by_run_id.map(|id| id.as_uuid()))
	.bind(&waitpoint.idempotency_key)
	.bind(&waitpoint.output)
	.bind(waitpoint.output_is_error)
	.bind(waitpoint.created_at)
	.bind(waitpoint.completed_at)
	.execute(executor)
	.await
	.context("failed inserting waitpoint")?;
	Ok(())
}

#[async_trait]
impl Database for PostgresDatabase {
	async fn upsert_environment(&self, env: &Environment) -> Result<()> {
		sqlx::query(
			"INSERT INTO environments (id, organization_id, project_id, env_type, concurrency_limit, env_vars) \
			 VALUES ($1, $2, $3, $4, $5, $6) \
			 ON CONFLICT (id) DO UPDATE SET concurrency_limit = $5, env_vars = $6",
		)
		.bind(env.id.as_uuid())
		.bind(env.organization_id.as_uuid())
		.bind(env.project_id.as_uuid())
		.bind(env.env_type.to_string())
		.bind(env.concurrency_limit as i32)
		.bind(serde_json::to_value(&env.env_vars)?)
		.execute(&self.pool)
		.await
		.context("failed upserting environment")?;
		Ok(())
	}

	async fn get_environment(&self, env_id: Id) -> Result<Option<Environment>> {
		let row = sqlx::query("SELECT * FROM environments WHERE id = $1")
			.bind(env_id.as_uuid())
			.fetch_optional(&self.pool)
			.await
			.context("failed fetching environment")?;

		row.map(|row| {
			let env_vars: serde_json::Value = row.try_get("env_vars")?;
			Ok(Environment {
				id: row.try_get::<Uuid, _>("id")?.into(),
				organization_id: row.try_get::<Uuid, _>("organization_id")?.into(),
				project_id: row.try_get::<Uuid, _>("project_id")?.into(),
				env_type: EnvironmentType::from_str(
					row.try_get::<String, _>("env_type")?.as_str(),
				)
				.context("invalid env type in row")?,
				concurrency_limit: row.try_get::<i32, _>("concurrency_limit")? as u32,
				env_vars: serde_json::from_value::<HashMap<String, String>>(env_vars)
					.context("invalid env vars in row")?,
			})
		})
		.transpose()
	}

	async fn create_run(
		&self,
		run: &Run,
		initial_snapshot: &ExecutionSnapshot,
		associated_waitpoint: &Waitpoint,
	) -> Result<()> {
		let mut tx = self.pool.begin().await?;

		sqlx::query(
			"INSERT INTO runs \
			 (id, friendly_id, status, task_identifier, payload, payload_type, organization_id, \
			  project_id, environment_id, environment_type, queue_name, master_queue, \
			  concurrency_key, idempotency_key, max_attempts, attempt_count, priority_ms, ttl_ms, \
			  delay_until, tags, parent_run_id, parent_attempt_id, root_run_id, batch_id, depth, \
			  resume_parent_on_completion, associated_waitpoint_id, trace_context, output, error, \
			  created_at, updated_at) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
			  $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32)",
		)
		.bind(run.id.as_uuid())
		.bind(&run.friendly_id)
		.bind(run.status.to_string())
		.bind(&run.task_identifier)
		.bind(&run.payload)
		.bind(&run.payload_type)
		.bind(run.organization_id.as_uuid())
		.bind(run.project_id.as_uuid())
		.bind(run.environment_id.as_uuid())
		.bind(run.environment_type.to_string())
		.bind(&run.queue_name)
		.bind(&run.master_queue)
		.bind(&run.concurrency_key)
		.bind(&run.idempotency_key)
		.bind(run.max_attempts as i32)
		.bind(run.attempt_count as i32)
		.bind(run.priority_ms)
		.bind(run.ttl_ms)
		.bind(run.delay_until)
		.bind(serde_json::to_value(&run.tags)?)
		.bind(run.parent_run_id.map(|id| id.as_uuid()))
		.bind(run.parent_attempt_id.map(|id| id.as_uuid()))
		.bind(run.root_run_id.map(|id| id.as_uuid()))
		.bind(run.batch_id.map(|id| id.as_uuid()))
		.bind(run.depth as i32)
		.bind(run.resume_parent_on_completion)
		.bind(run.associated_waitpoint_id.map(|id| id.as_uuid()))
		.bind(&run.trace_context)
		.bind(&run.output)
		.bind(run.error.as_ref().map(serde_json::to_value).transpose()?)
		.bind(run.created_at)
		.bind(run.updated_at)
		.execute(&mut *tx)
		.await
		.context("failed inserting run")?;

		insert_snapshot_tx(&mut *tx, initial_snapshot).await?;
		insert_waitpoint_tx(&mut *tx, associated_waitpoint).await?;

		tx.commit().await?;
		Ok(())
	}

	async fn get_run(&self, run_id: Id) -> Result<Option<Run>> {
		let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
			.bind(run_id.as_uuid())
			.fetch_optional(&self.pool)
			.await
			.context("failed fetching run")?;
		row.as_ref().map(run_from_row).transpose()
	}

	async fn find_run_by_idempotency_key(
		&self,
		environment_id: Id,
		idempotency_key: &str,
	) -> Result<Option<Run>> {
		let row = sqlx::query(
			"SELECT * FROM runs WHERE environment_id = $1 AND idempotency_key = $2",
		)
		.bind(environment_id.as_uuid())
		.bind(idempotency_key)
		.fetch_optional(&self.pool)
		.await
		.context("failed fetching run by idempotency key")?;
		row.as_ref().map(run_from_row).transpose()
	}

	async fn update_run_status(&self, run_id: Id, status: RunStatus) -> Result<()> {
		sqlx::query("UPDATE runs SET status = $2, updated_at = $3 WHERE id = $1")
			.bind(run_id.as_uuid())
			.bind(status.to_string())
			.bind(flywheel_util::timestamp::now())
			.execute(&self.pool)
			.await
			.context("failed updating run status")?;
		Ok(())
	}

	async fn set_run_result(
		&self,
		run_id: Id,
		status: RunStatus,
		output: Option<String>,
		error: Option<RunError>,
	) -> Result<()> {
		sqlx::query(
			"UPDATE runs SET status = $2, output = $3, error = $4, updated_at = $5 WHERE id = $1",
		)
		.bind(run_id.as_uuid())
		.bind(status.to_string())
		.bind(output)
		.bind(error.as_ref().map(serde_json::to_value).transpose()?)
		.bind(flywheel_util::timestamp::now())
		.execute(&self.pool)
		.await
		.context("failed setting run result")?;
		Ok(())
	}

	async fn set_run_attempt_count(&self, run_id: Id, attempt_count: u32) -> Result<()> {
		sqlx::query("UPDATE runs SET attempt_count = $2, updated_at = $3 WHERE id = $1")
			.bind(run_id.as_uuid())
			.bind(attempt_count as i32)
			.bind(flywheel_util::timestamp::now())
			.execute(&self.pool)
			.await
			.context("failed updating attempt count")?;
		Ok(())
	}

	async fn insert_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
		insert_snapshot_tx(&self.pool, snapshot).await
	}

	async fn latest_snapshot(&self, run_id: Id) -> Result<Option<ExecutionSnapshot>> {
		let row = sqlx::query(
			"SELECT * FROM execution_snapshots WHERE run_id = $1 ORDER BY seq DESC LIMIT 1",
		)
		.bind(run_id.as_uuid())
		.fetch_optional(&self.pool)
		.await
		.context("failed fetching latest snapshot")?;
		row.as_ref().map(snapshot_from_row).transpose()
	}

	async fn list_snapshots(&self, run_id: Id) -> Result<Vec<ExecutionSnapshot>> {
		let rows =
			sqlx::query("SELECT * FROM execution_snapshots WHERE run_id = $1 ORDER BY seq ASC")
				.bind(run_id.as_uuid())
				.fetch_all(&self.pool)
				.await
				.context("failed listing snapshots")?;
		rows.iter().map(snapshot_from_row).collect()
	}

	async fn create_waitpoint(&self, waitpoint: &Waitpoint) -> Result<()> {
		insert_waitpoint_tx(&self.pool, waitpoint).await
	}

	async fn get_waitpoint(&self, waitpoint_id: Id) -> Result<Option<Waitpoint>> {
		let row = sqlx::query("SELECT * FROM waitpoints WHERE id = $1")
			.bind(waitpoint_id.as_uuid())
			.fetch_optional(&self.pool)
			.await
			.context("failed fetching waitpoint")?;
		row.as_ref().map(waitpoint_from_row).transpose()
	}

	async fn find_waitpoint_by_idempotency_key(
		&self,
		project_id: Id,
		idempotency_key: &str,
	) -> Result<Option<Waitpoint>> {
		let row = sqlx::query(
			"SELECT * FROM waitpoints WHERE project_id = $1 AND idempotency_key = $2",
		)
		.bind(project_id.as_uuid())
		.bind(idempotency_key)
		.fetch_optional(&self.pool)
		.await
		.context("failed fetching waitpoint by idempotency key")?;
		row.as_ref().map(waitpoint_from_row).transpose()
	}

	async fn block_run_with_waitpoint(
		&self,
		run_id: Id,
		waitpoint_id: Id,
		project_id: Id,
		run_status: RunStatus,
	) -> Result<()> {
		let mut tx = self.pool.begin().await?;

		sqlx::query("UPDATE runs SET status = $2, updated_at = $3 WHERE id = $1")
			.bind(run_id.as_uuid())
			.bind(run_status.to_string())
			.bind(flywheel_util::timestamp::now())
			.execute(&mut *tx)
			.await
			.context("failed updating blocked run status")?;

		sqlx::query(
			"INSERT INTO run_waitpoints (run_id, waitpoint_id, project_id) \
			 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
		)
		.bind(run_id.as_uuid())
		.bind(waitpoint_id.as_uuid())
		.bind(project_id.as_uuid())
		.execute(&mut *tx)
		.await
		.context("failed inserting run waitpoint")?;

		tx.commit().await?;
		Ok(())
	}

	async fn complete_waitpoint(
		&self,
		waitpoint_id: Id,
		output: Option<String>,
		output_is_error: bool,
		completed_at: i64,
	) -> Result<CompleteWaitpointOutcome> {
		let mut tx = self.pool.begin().await?;

		let status: Option<String> =
			sqlx::query_scalar("SELECT status FROM waitpoints WHERE id = $1 FOR UPDATE")
				.bind(waitpoint_id.as_uuid())
				.fetch_optional(&mut *tx)
				.await
				.context("failed locking waitpoint")?;
		let Some(status) = status else {
			anyhow::bail!("waitpoint {waitpoint_id} not found");
		};
		if status == WaitpointStatus::Completed.to_string() {
			tx.commit().await?;
			return Ok(CompleteWaitpointOutcome {
				already_completed: true,
				unblocked: Vec::new(),
			});
		}

		let blocked: Vec<Uuid> =
			sqlx::query_scalar("SELECT run_id FROM run_waitpoints WHERE waitpoint_id = $1")
				.bind(waitpoint_id.as_uuid())
				.fetch_all(&mut *tx)
				.await
				.context("failed listing blocked runs")?;

		sqlx::query("DELETE FROM run_waitpoints WHERE waitpoint_id = $1")
			.bind(waitpoint_id.as_uuid())
			.execute(&mut *tx)
			.await
			.context("failed deleting run waitpoints")?;

		sqlx::query(
			"UPDATE waitpoints SET status = $2, output = $3, output_is_error = $4, \
			 completed_at = $5 WHERE id = $1",
		)
		.bind(waitpoint_id.as_uuid())
		.bind(WaitpointStatus::Completed.to_string())
		.bind(output)
		.bind(output_is_error)
		.bind(completed_at)
		.execute(&mut *tx)
		.await
		.context("failed completing waitpoint")?;

		let mut unblocked = Vec::new();
		for run_id in blocked {
			let remaining: i64 =
				sqlx::query_scalar("SELECT COUNT(*) FROM run_waitpoints WHERE run_id = $1")
					.bind(run_id)
					.fetch_one(&mut *tx)
					.await
					.context("failed counting remaining waitpoints")?;
			if remaining > 0 {
				continue;
			}

			let row = sqlx::query(
				"SELECT * FROM runs WHERE id = $1 AND status IN ('PENDING', 'WAITING_TO_RESUME', 'DELAYED')",
			)
			.bind(run_id)
			.fetch_optional(&mut *tx)
			.await
			.context("failed fetching unblocked run")?;
			if let Some(row) = row {
				unblocked.push(run_from_row(&row)?);
			}
		}

		tx.commit().await?;

		Ok(CompleteWaitpointOutcome {
			already_completed: false,
			unblocked,
		})
	}

	async fn blocking_waitpoint_count(&self, run_id: Id) -> Result<u64> {
		let count: i64 =
			sqlx::query_scalar("SELECT COUNT(*) FROM run_waitpoints WHERE run_id = $1")
				.bind(run_id.as_uuid())
				.fetch_one(&self.pool)
				.await
				.context("failed counting waitpoints")?;
		Ok(count as u64)
	}

	async fn list_stale_waiting_runs(&self, older_than: i64, limit: usize) -> Result<Vec<Run>> {
		let rows = sqlx::query(
			"SELECT * FROM runs WHERE status = 'WAITING_TO_RESUME' AND updated_at < $1 \
			 ORDER BY updated_at ASC LIMIT $2",
		)
		.bind(older_than)
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.context("failed listing stale waiting runs")?;
		rows.iter().map(run_from_row).collect()
	}

	async fn create_attempt(&self, attempt: &Attempt) -> Result<()> {
		sqlx::query(
			"INSERT INTO attempts (id, run_id, number, worker_id, started_at, completed_at, error) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7)",
		)
		.bind(attempt.id.as_uuid())
		.bind(attempt.run_id.as_uuid())
		.bind(attempt.number as i32)
		.bind(&attempt.worker_id)
		.bind(attempt.started_at)
		.bind(attempt.completed_at)
		.bind(attempt.error.as_ref().map(serde_json::to_value).transpose()?)
		.execute(&self.pool)
		.await
		.context("failed inserting attempt")?;
		Ok(())
	}

	async fn latest_attempt(&self, run_id: Id) -> Result<Option<Attempt>> {
		let row =
			sqlx::query("SELECT * FROM attempts WHERE run_id = $1 ORDER BY number DESC LIMIT 1")
				.bind(run_id.as_uuid())
				.fetch_optional(&self.pool)
				.await
				.context("failed fetching latest attempt")?;
		row.as_ref().map(attempt_from_row).transpose()
	}

	async fn complete_attempt(
		&self,
		attempt_id: Id,
		completed_at: i64,
		error: Option<RunError>,
	) -> Result<()> {
		sqlx::query("UPDATE attempts SET completed_at = $2, error = $3 WHERE id = $1")
			.bind(attempt_id.as_uuid())
			.bind(completed_at)
			.bind(error.as_ref().map(serde_json::to_value).transpose()?)
			.execute(&self.pool)
			.await
			.context("failed completing attempt")?;
		Ok(())
	}

	async fn upsert_task_queue(&self, queue: &TaskQueue) -> Result<()> {
		sqlx::query(
			"INSERT INTO task_queues (environment_id, name, concurrency_limit, rate_limit, kind) \
			 VALUES ($1, $2, $3, $4, $5) \
			 ON CONFLICT (environment_id, name) DO UPDATE \
			 SET concurrency_limit = $3, rate_limit = $4, kind = $5",
		)
		.bind(queue.environment_id.as_uuid())
		.bind(&queue.name)
		.bind(queue.concurrency_limit.map(|l| l as i32))
		.bind(queue.rate_limit.map(|l| l as i32))
		.bind(queue.kind.to_string())
		.execute(&self.pool)
		.await
		.context("failed upserting task queue")?;
		Ok(())
	}

	async fn get_task_queue(&self, environment_id: Id, name: &str) -> Result<Option<TaskQueue>> {
		let row = sqlx::query("SELECT * FROM task_queues WHERE environment_id = $1 AND name = $2")
			.bind(environment_id.as_uuid())
			.bind(name)
			.fetch_optional(&self.pool)
			.await
			.context("failed fetching task queue")?;

		row.map(|row| {
			Ok(TaskQueue {
				environment_id: row.try_get::<Uuid, _>("environment_id")?.into(),
				name: row.try_get("name")?,
				concurrency_limit: row
					.try_get::<Option<i32>, _>("concurrency_limit")?
					.map(|l| l as u32),
				rate_limit: row
					.try_get::<Option<i32>, _>("rate_limit")?
					.map(|l| l as u32),
				kind: TaskQueueKind::from_str(row.try_get::<String, _>("kind")?.as_str())
					.context("invalid task queue kind in row")?,
			})
		})
		.transpose()
	}
}
