use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub type QueueDriverHandle = Arc<dyn QueueDriver>;

/// Every key a message-addressed operation touches, precomputed by the
/// facade from the stored message body so driver scripts never re-derive
/// tenancy.
#[derive(Debug, Clone)]
pub struct MessageKeys {
	/// Also the member stored in the master queue's sorted set.
	pub queue_key: String,
	pub master_queue_key: String,
	pub message_key: String,
	pub consumer_key: String,
	pub env_current_key: String,
	pub env_limit_key: String,
	pub queue_current_key: String,
	pub queue_limit_key: String,
	pub task_current_key: String,
	pub task_limit_key: String,
}

/// Keys for a claim attempt. The message id is unknown until the script pops
/// the queue head, so id- and task-dependent keys are derived inside the
/// driver from the listed prefixes.
#[derive(Debug, Clone)]
pub struct ClaimKeys {
	pub queue_key: String,
	pub master_queue_key: String,
	pub env_current_key: String,
	pub env_limit_key: String,
	pub queue_current_key: String,
	pub queue_limit_key: String,
	/// `{env_key}:task:`; combined with the body's task identifier and the
	/// `:currentConcurrency` / `:concurrency` suffixes.
	pub task_key_prefix: String,
	pub message_key_prefix: String,
	pub consumer_key_prefix: String,
}

/// Which budget stopped a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
	Environment,
	Queue,
	Task,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
	/// Message id + raw body; all three concurrency counters incremented and
	/// the message moved to the consumer's in-flight set.
	Claimed { message_id: String, body: String },
	/// A concurrency budget is exhausted; the queue should be skipped this
	/// pass.
	LimitReached(LimitScope),
	/// No message was available at or before `now`.
	Empty,
}

/// Storage backend for the run queue. Each method is atomic: the Redis
/// driver runs one server-side script per call, the memory driver holds one
/// lock per call.
#[async_trait]
pub trait QueueDriver: Send + Sync {
	/// Adds the message to its queue sorted set, writes the body, and updates
	/// the master queue's membership score (min of message scores).
	async fn enqueue(
		&self,
		keys: &MessageKeys,
		message_id: &str,
		body: &str,
		score: i64,
	) -> Result<()>;

	/// Queue keys under the master queue with earliest-score ≤ `now`, oldest
	/// first.
	async fn master_queue_candidates(
		&self,
		master_queue_key: &str,
		now: i64,
		limit: usize,
	) -> Result<Vec<String>>;

	/// Claims the oldest available message on the queue, subject to all three
	/// concurrency budgets.
	async fn try_claim(
		&self,
		keys: &ClaimKeys,
		in_flight_key: &str,
		now: i64,
		default_env_limit: u32,
	) -> Result<ClaimOutcome>;

	/// Drops the message entirely: counters, in-flight membership, queue
	/// entry, and body. Idempotent.
	async fn acknowledge(&self, keys: &MessageKeys, message_id: &str) -> Result<()>;

	/// Releases counters and re-inserts the message id with the given score.
	/// The body is retained. Idempotent.
	async fn nack(&self, keys: &MessageKeys, message_id: &str, score: i64) -> Result<()>;

	/// Releases counters and in-flight membership without re-queueing or
	/// deleting the body. Used when a run blocks on waitpoints.
	async fn release_concurrency(&self, keys: &MessageKeys, message_id: &str) -> Result<()>;

	/// Re-increments counters if every budget allows it. Returns false when a
	/// budget would be exceeded, signalling the caller to re-queue instead.
	async fn reacquire_concurrency(
		&self,
		keys: &MessageKeys,
		message_id: &str,
		default_env_limit: u32,
	) -> Result<bool>;

	async fn read_message(&self, message_key: &str) -> Result<Option<String>>;

	async fn set_limit(&self, limit_key: &str, limit: u32) -> Result<()>;

	async fn remove_limit(&self, limit_key: &str) -> Result<()>;

	async fn get_limit(&self, limit_key: &str) -> Result<Option<u32>>;

	async fn queue_length(&self, queue_key: &str) -> Result<u64>;

	async fn set_cardinality(&self, set_key: &str) -> Result<u64>;
}
