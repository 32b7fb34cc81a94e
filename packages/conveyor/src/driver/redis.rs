use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use indoc::indoc;
use redis::AsyncCommands;

use crate::driver::{ClaimKeys, ClaimOutcome, LimitScope, MessageKeys, QueueDriver};

/// Atomically inserts the message and raises the queue's visibility in the
/// master queue if this message is now the earliest.
const ENQUEUE_SCRIPT: &str = indoc! {"
	-- KEYS[1] queue, KEYS[2] master, KEYS[3] message body
	-- ARGV[1] score, ARGV[2] message id, ARGV[3] body, ARGV[4] queue member
	redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
	redis.call('SET', KEYS[3], ARGV[3])
	local current = redis.call('ZSCORE', KEYS[2], ARGV[4])
	if not current or tonumber(ARGV[1]) < tonumber(current) then
		redis.call('ZADD', KEYS[2], ARGV[1], ARGV[4])
	end
	return redis.status_reply('OK')
"};

/// The single-script dequeue required by the concurrency invariants: limit
/// checks, counter increments, queue→in-flight move, and master-queue
/// maintenance all happen under one atomic execution. Task-level keys are
/// derived from the message body since the id is unknown until the head is
/// popped.
const CLAIM_SCRIPT: &str = indoc! {"
	-- KEYS[1] queue, KEYS[2] master, KEYS[3] env current, KEYS[4] queue current,
	-- KEYS[5] env limit, KEYS[6] queue limit, KEYS[7] in-flight set
	-- ARGV[1] now, ARGV[2] default env limit, ARGV[3] message key prefix,
	-- ARGV[4] consumer key prefix, ARGV[5] task key prefix, ARGV[6] in-flight key name
	local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
	if #ids == 0 then
		return {'empty'}
	end
	local id = ids[1]

	local env_limit = tonumber(redis.call('GET', KEYS[5]) or ARGV[2])
	local queue_limit = tonumber(redis.call('GET', KEYS[6]) or env_limit)
	if queue_limit > env_limit then
		queue_limit = env_limit
	end

	if redis.call('SCARD', KEYS[3]) >= env_limit then
		return {'limit', 'environment'}
	end
	if redis.call('SCARD', KEYS[4]) >= queue_limit then
		return {'limit', 'queue'}
	end

	local body = redis.call('GET', ARGV[3] .. id)
	if not body then
		-- Orphaned id; drop it so the queue does not wedge on it.
		redis.call('ZREM', KEYS[1], id)
		return {'empty'}
	end

	local message = cjson.decode(body)
	local task_current = ARGV[5] .. message.task_identifier .. ':currentConcurrency'
	local task_limit = redis.call('GET', ARGV[5] .. message.task_identifier .. ':concurrency')
	if task_limit and redis.call('SCARD', task_current) >= tonumber(task_limit) then
		return {'limit', 'task'}
	end

	redis.call('ZREM', KEYS[1], id)
	redis.call('SADD', KEYS[3], id)
	redis.call('SADD', KEYS[4], id)
	redis.call('SADD', task_current, id)
	redis.call('SADD', KEYS[7], id)
	redis.call('SET', ARGV[4] .. id, ARGV[6])

	local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
	if #head == 0 then
		redis.call('ZREM', KEYS[2], KEYS[1])
	else
		redis.call('ZADD', KEYS[2], head[2], KEYS[1])
	end

	return {'ok', id, body}
"};

const ACK_SCRIPT: &str = indoc! {"
	-- KEYS[1] queue, KEYS[2] master, KEYS[3] env current, KEYS[4] queue current,
	-- KEYS[5] task current, KEYS[6] message body, KEYS[7] consumer marker
	-- ARGV[1] message id, ARGV[2] queue member
	redis.call('SREM', KEYS[3], ARGV[1])
	redis.call('SREM', KEYS[4], ARGV[1])
	redis.call('SREM', KEYS[5], ARGV[1])
	redis.call('ZREM', KEYS[1], ARGV[1])
	local in_flight = redis.call('GET', KEYS[7])
	if in_flight then
		redis.call('SREM', in_flight, ARGV[1])
		redis.call('DEL', KEYS[7])
	end
	redis.call('DEL', KEYS[6])
	local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
	if #head == 0 then
		redis.call('ZREM', KEYS[2], ARGV[2])
	else
		redis.call('ZADD', KEYS[2], head[2], ARGV[2])
	end
	return redis.status_reply('OK')
"};

const NACK_SCRIPT: &str = indoc! {"
	-- KEYS[1] queue, KEYS[2] master, KEYS[3] env current, KEYS[4] queue current,
	-- KEYS[5] task current, KEYS[6] consumer marker
	-- ARGV[1] message id, ARGV[2] retry score, ARGV[3] queue member
	redis.call('SREM', KEYS[3], ARGV[1])
	redis.call('SREM', KEYS[4], ARGV[1])
	redis.call('SREM', KEYS[5], ARGV[1])
	local in_flight = redis.call('GET', KEYS[6])
	if in_flight then
		redis.call('SREM', in_flight, ARGV[1])
		redis.call('DEL', KEYS[6])
	end
	redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
	local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
	redis.call('ZADD', KEYS[2], head[2], ARGV[3])
	return redis.status_reply('OK')
"};

const RELEASE_SCRIPT: &str = indoc! {"
	-- KEYS[1] env current, KEYS[2] queue current, KEYS[3] task current,
	-- KEYS[4] consumer marker
	-- ARGV[1] message id
	redis.call('SREM', KEYS[1], ARGV[1])
	redis.call('SREM', KEYS[2], ARGV[1])
	redis.call('SREM', KEYS[3], ARGV[1])
	local in_flight = redis.call('GET', KEYS[4])
	if in_flight then
		redis.call('SREM', in_flight, ARGV[1])
		redis.call('DEL', KEYS[4])
	end
	return redis.status_reply('OK')
"};

const REACQUIRE_SCRIPT: &str = indoc! {"
	-- KEYS[1] env current, KEYS[2] queue current, KEYS[3] task current,
	-- KEYS[4] env limit, KEYS[5] queue limit, KEYS[6] task limit
	-- ARGV[1] message id, ARGV[2] default env limit
	if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
		return 1
	end

	local env_limit = tonumber(redis.call('GET', KEYS[4]) or ARGV[2])
	local queue_limit = tonumber(redis.call('GET', KEYS[5]) or env_limit)
	if queue_limit > env_limit then
		queue_limit = env_limit
	end

	if redis.call('SCARD', KEYS[1]) >= env_limit then
		return 0
	end
	if redis.call('SCARD', KEYS[2]) >= queue_limit then
		return 0
	end
	local task_limit = redis.call('GET', KEYS[6])
	if task_limit and redis.call('SCARD', KEYS[3]) >= tonumber(task_limit) then
		return 0
	end

	redis.call('SADD', KEYS[1], ARGV[1])
	redis.call('SADD', KEYS[2], ARGV[1])
	redis.call('SADD', KEYS[3], ARGV[1])
	return 1
"};

pub struct RedisDriver {
	pool: flywheel_pools::RedisPool,
}

impl RedisDriver {
	pub fn new(pool: flywheel_pools::RedisPool) -> Self {
		RedisDriver { pool }
	}

	fn conn(&self) -> flywheel_pools::RedisPool {
		self.pool.clone()
	}
}

#[async_trait]
impl QueueDriver for RedisDriver {
	async fn enqueue(
		&self,
		keys: &MessageKeys,
		message_id: &str,
		body: &str,
		score: i64,
	) -> Result<()> {
		let mut conn = self.conn();
		let _: () = redis::Script::new(ENQUEUE_SCRIPT)
			.key(&keys.queue_key)
			.key(&keys.master_queue_key)
			.key(&keys.message_key)
			.arg(score)
			.arg(message_id)
			.arg(body)
			.arg(&keys.queue_key)
			.invoke_async(&mut conn)
			.await
			.context("enqueue script failed")?;
		Ok(())
	}

	async fn master_queue_candidates(
		&self,
		master_queue_key: &str,
		now: i64,
		limit: usize,
	) -> Result<Vec<String>> {
		let mut conn = self.conn();
		let candidates: Vec<String> = conn
			.zrangebyscore_limit(master_queue_key, "-inf", now, 0, limit as isize)
			.await
			.context("master queue range failed")?;
		Ok(candidates)
	}

	async fn try_claim(
		&self,
		keys: &ClaimKeys,
		in_flight_key: &str,
		now: i64,
		default_env_limit: u32,
	) -> Result<ClaimOutcome> {
		let mut conn = self.conn();
		let reply: Vec<String> = redis::Script::new(CLAIM_SCRIPT)
			.key(&keys.queue_key)
			.key(&keys.master_queue_key)
			.key(&keys.env_current_key)
			.key(&keys.queue_current_key)
			.key(&keys.env_limit_key)
			.key(&keys.queue_limit_key)
			.key(in_flight_key)
			.arg(now)
			.arg(default_env_limit)
			.arg(&keys.message_key_prefix)
			.arg(&keys.consumer_key_prefix)
			.arg(&keys.task_key_prefix)
			.arg(in_flight_key)
			.invoke_async(&mut conn)
			.await
			.context("claim script failed")?;

		match reply.first().map(|s| s.as_str()) {
			Some("ok") => {
				let [_, message_id, body] = reply.as_slice() else {
					bail!("malformed claim reply: {reply:?}");
				};
				Ok(ClaimOutcome::Claimed {
					message_id: message_id.clone(),
					body: body.clone(),
				})
			}
			Some("limit") => {
				let scope = match reply.get(1).map(|s| s.as_str()) {
					Some("environment") => LimitScope::Environment,
					Some("queue") => LimitScope::Queue,
					Some("task") => LimitScope::Task,
					other => bail!("malformed claim limit scope: {other:?}"),
				};
				Ok(ClaimOutcome::LimitReached(scope))
			}
			Some("empty") => Ok(ClaimOutcome::Empty),
			other => bail!("malformed claim reply tag: {other:?}"),
		}
	}

	async fn acknowledge(&self, keys: &MessageKeys, message_id: &str) -> Result<()> {
		let mut conn = self.conn();
		let _: () = redis::Script::new(ACK_SCRIPT)
			.key(&keys.queue_key)
			.key(&keys.master_queue_key)
			.key(&keys.env_current_key)
			.key(&keys.queue_current_key)
			.key(&keys.task_current_key)
			.key(&keys.message_key)
			.key(&keys.consumer_key)
			.arg(message_id)
			.arg(&keys.queue_key)
			.invoke_async(&mut conn)
			.await
			.context("ack script failed")?;
		Ok(())
	}

	async fn nack(&self, keys: &MessageKeys, message_id: &str, score: i64) -> Result<()> {
		let mut conn = self.conn();
		let _: () = redis::Script::new(NACK_SCRIPT)
			.key(&keys.queue_key)
			.key(&keys.master_queue_key)
			.key(&keys.env_current_key)
			.key(&keys.queue_current_key)
			.key(&keys.task_current_key)
			.key(&keys.consumer_key)
			.arg(message_id)
			.arg(score)
			.arg(&keys.queue_key)
			.invoke_async(&mut conn)
			.await
			.context("nack script failed")?;
		Ok(())
	}

	async fn release_concurrency(&self, keys: &MessageKeys, message_id: &str) -> Result<()> {
		let mut conn = self.conn();
		let _: () = redis::Script::new(RELEASE_SCRIPT)
			.key(&keys.env_current_key)
			.key(&keys.queue_current_key)
			.key(&keys.task_current_key)
			.key(&keys.consumer_key)
			.arg(message_id)
			.invoke_async(&mut conn)
			.await
			.context("release script failed")?;
		Ok(())
	}

	async fn reacquire_concurrency(
		&self,
		keys: &MessageKeys,
		message_id: &str,
		default_env_limit: u32,
	) -> Result<bool> {
		let mut conn = self.conn();
		let acquired: i64 = redis::Script::new(REACQUIRE_SCRIPT)
			.key(&keys.env_current_key)
			.key(&keys.queue_current_key)
			.key(&keys.task_current_key)
			.key(&keys.env_limit_key)
			.key(&keys.queue_limit_key)
			.key(&keys.task_limit_key)
			.arg(message_id)
			.arg(default_env_limit)
			.invoke_async(&mut conn)
			.await
			.context("reacquire script failed")?;
		Ok(acquired == 1)
	}

	async fn read_message(&self, message_key: &str) -> Result<Option<String>> {
		let mut conn = self.conn();
		let body: Option<String> = conn
			.get(message_key)
			.await
			.context("message read failed")?;
		Ok(body)
	}

	async fn set_limit(&self, limit_key: &str, limit: u32) -> Result<()> {
		let mut conn = self.conn();
		let _: () = conn
			.set(limit_key, limit)
			.await
			.context("limit write failed")?;
		Ok(())
	}

	async fn remove_limit(&self, limit_key: &str) -> Result<()> {
		let mut conn = self.conn();
		let _: () = conn.del(limit_key).await.context("limit delete failed")?;
		Ok(())
	}

	async fn get_limit(&self, limit_key: &str) -> Result<Option<u32>> {
		let mut conn = self.conn();
		let limit: Option<u32> = conn.get(limit_key).await.context("limit read failed")?;
		Ok(limit)
	}

	async fn queue_length(&self, queue_key: &str) -> Result<u64> {
		let mut conn = self.conn();
		let len: u64 = conn.zcard(queue_key).await.context("queue length failed")?;
		Ok(len)
	}

	async fn set_cardinality(&self, set_key: &str) -> Result<u64> {
		let mut conn = self.conn();
		let len: u64 = conn.scard(set_key).await.context("set cardinality failed")?;
		Ok(len)
	}
}
