use anyhow::{Context, Result};
use async_trait::async_trait;
use indoc::indoc;
use redis::AsyncCommands;

use crate::driver::TimerDriver;
use crate::job::TimerJob;

const TIMELINE_KEY: &str = "workQueue";
const JOB_KEY_PREFIX: &str = "job:";

/// Claims due jobs and bumps their scores past the visibility window in one
/// atomic execution.
const PULL_SCRIPT: &str = indoc! {"
	-- KEYS[1] timeline
	-- ARGV[1] now, ARGV[2] visibility deadline, ARGV[3] limit, ARGV[4] job key prefix
	local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
	local out = {}
	for _, id in ipairs(ids) do
		local job_key = ARGV[4] .. id
		if redis.call('EXISTS', job_key) == 1 then
			redis.call('ZADD', KEYS[1], ARGV[2], id)
			local attempts = redis.call('HINCRBY', job_key, 'attempts', 1)
			local kind = redis.call('HGET', job_key, 'kind')
			local payload = redis.call('HGET', job_key, 'payload')
			table.insert(out, id)
			table.insert(out, kind)
			table.insert(out, payload)
			table.insert(out, tostring(attempts))
		else
			-- Body vanished; drop the orphaned timer.
			redis.call('ZREM', KEYS[1], id)
		end
	end
	return out
"};

pub struct RedisTimerDriver {
	pool: flywheel_pools::RedisPool,
	prefix: String,
}

impl RedisTimerDriver {
	pub fn new(pool: flywheel_pools::RedisPool, prefix: impl Into<String>) -> Self {
		RedisTimerDriver {
			pool,
			prefix: prefix.into(),
		}
	}

	fn timeline_key(&self) -> String {
		format!("{}{}", self.prefix, TIMELINE_KEY)
	}

	fn job_key(&self, job_id: &str) -> String {
		format!("{}{}{}", self.prefix, JOB_KEY_PREFIX, job_id)
	}

	fn job_key_prefix(&self) -> String {
		format!("{}{}", self.prefix, JOB_KEY_PREFIX)
	}
}

#[async_trait]
impl TimerDriver for RedisTimerDriver {
	async fn enqueue(&self, job: &TimerJob) -> Result<()> {
		let mut conn = self.pool.clone();
		let payload =
			serde_json::to_string(&job.payload).context("failed serializing job payload")?;

		let mut pipe = redis::pipe();
		pipe.atomic()
			.hset(self.job_key(&job.id), "kind", &job.kind)
			.hset(self.job_key(&job.id), "payload", payload)
			.hset(self.job_key(&job.id), "attempts", 0)
			.zadd(self.timeline_key(), &job.id, job.available_at);
		let _: () = pipe
			.query_async(&mut conn)
			.await
			.context("job enqueue failed")?;

		Ok(())
	}

	async fn pull(
		&self,
		now: i64,
		visibility_timeout_ms: i64,
		limit: usize,
	) -> Result<Vec<TimerJob>> {
		let mut conn = self.pool.clone();
		let reply: Vec<String> = redis::Script::new(PULL_SCRIPT)
			.key(self.timeline_key())
			.arg(now)
			.arg(now + visibility_timeout_ms)
			.arg(limit)
			.arg(self.job_key_prefix())
			.invoke_async(&mut conn)
			.await
			.context("pull script failed")?;

		let mut jobs = Vec::with_capacity(reply.len() / 4);
		for chunk in reply.chunks_exact(4) {
			let [id, kind, payload, attempts] = chunk else {
				continue;
			};
			jobs.push(TimerJob {
				id: id.clone(),
				kind: kind.clone(),
				payload: serde_json::from_str(payload)
					.context("failed deserializing job payload")?,
				available_at: now,
				attempts: attempts.parse().unwrap_or(1),
			});
		}

		Ok(jobs)
	}

	async fn ack(&self, job_id: &str) -> Result<()> {
		let mut conn = self.pool.clone();
		let mut pipe = redis::pipe();
		pipe.atomic()
			.zrem(self.timeline_key(), job_id)
			.del(self.job_key(job_id));
		let _: () = pipe.query_async(&mut conn).await.context("job ack failed")?;
		Ok(())
	}

	async fn nack(&self, job_id: &str, retry_at: i64) -> Result<()> {
		let mut conn = self.pool.clone();
		let _: () = conn
			.zadd(self.timeline_key(), job_id, retry_at)
			.await
			.context("job nack failed")?;
		Ok(())
	}

	async fn cancel(&self, job_id: &str) -> Result<()> {
		self.ack(job_id).await
	}

	async fn len(&self) -> Result<u64> {
		let mut conn = self.pool.clone();
		let len: u64 = conn
			.zcard(self.timeline_key())
			.await
			.context("timeline length failed")?;
		Ok(len)
	}
}
