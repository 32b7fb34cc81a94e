use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flywheel_types::QueueMessage;

use crate::driver::{ClaimKeys, ClaimOutcome, LimitScope, MessageKeys, QueueDriver};

/// In-process driver used by tests and local development. A single mutex
/// over the whole state gives each driver call the same atomicity the Redis
/// driver gets from server-side scripts.
#[derive(Default)]
pub struct MemoryDriver {
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	/// queue key → (score, message id), ordered.
	queues: HashMap<String, BTreeSet<(i64, String)>>,
	/// master queue key → queue key → earliest score.
	masters: HashMap<String, HashMap<String, i64>>,
	/// message key → body.
	messages: HashMap<String, String>,
	/// current-concurrency sets (env/queue/task) and in-flight sets.
	sets: HashMap<String, HashSet<String>>,
	/// limit keys.
	limits: HashMap<String, u32>,
	/// consumer marker key → in-flight set key.
	consumers: HashMap<String, String>,
}

impl MemoryDriver {
	pub fn new() -> Self {
		Self::default()
	}
}

impl State {
	fn refresh_master(&mut self, master_queue_key: &str, queue_key: &str) {
		let earliest = self
			.queues
			.get(queue_key)
			.and_then(|q| q.iter().next())
			.map(|(score, _)| *score);
		let master = self.masters.entry(master_queue_key.to_string()).or_default();
		match earliest {
			Some(score) => {
				master.insert(queue_key.to_string(), score);
			}
			None => {
				master.remove(queue_key);
			}
		}
	}

	fn remove_from_queue(&mut self, queue_key: &str, message_id: &str) {
		if let Some(queue) = self.queues.get_mut(queue_key) {
			queue.retain(|(_, id)| id != message_id);
		}
	}

	fn srem(&mut self, set_key: &str, member: &str) {
		if let Some(set) = self.sets.get_mut(set_key) {
			set.remove(member);
		}
	}

	fn sadd(&mut self, set_key: &str, member: &str) {
		self.sets
			.entry(set_key.to_string())
			.or_default()
			.insert(member.to_string());
	}

	fn scard(&self, set_key: &str) -> u64 {
		self.sets.get(set_key).map(|s| s.len() as u64).unwrap_or(0)
	}

	fn release(&mut self, keys: &MessageKeys, message_id: &str) {
		self.srem(&keys.env_current_key, message_id);
		self.srem(&keys.queue_current_key, message_id);
		self.srem(&keys.task_current_key, message_id);
		if let Some(in_flight_key) = self.consumers.remove(&keys.consumer_key) {
			self.srem(&in_flight_key, message_id);
		}
	}

	/// Queue limits above the env limit can never be satisfied, so clamp.
	fn env_and_queue_limits(
		&self,
		env_limit_key: &str,
		queue_limit_key: &str,
		default_env_limit: u32,
	) -> (u32, u32) {
		let env_limit = self
			.limits
			.get(env_limit_key)
			.copied()
			.unwrap_or(default_env_limit);
		let queue_limit = self
			.limits
			.get(queue_limit_key)
			.copied()
			.unwrap_or(env_limit)
			.min(env_limit);
		(env_limit, queue_limit)
	}
}

#[async_trait]
impl QueueDriver for MemoryDriver {
	async fn enqueue(
		&self,
		keys: &MessageKeys,
		message_id: &str,
		body: &str,
		score: i64,
	) -> Result<()> {
		let mut state = self.state.lock().unwrap();

		// Re-enqueue of an id replaces its old position.
		state.remove_from_queue(&keys.queue_key, message_id);
		state
			.queues
			.entry(keys.queue_key.clone())
			.or_default()
			.insert((score, message_id.to_string()));
		state
			.messages
			.insert(keys.message_key.clone(), body.to_string());
		state.refresh_master(&keys.master_queue_key, &keys.queue_key);

		Ok(())
	}

	async fn master_queue_candidates(
		&self,
		master_queue_key: &str,
		now: i64,
		limit: usize,
	) -> Result<Vec<String>> {
		let state = self.state.lock().unwrap();

		let Some(master) = state.masters.get(master_queue_key) else {
			return Ok(Vec::new());
		};

		let mut candidates = master
			.iter()
			.filter(|(_, score)| **score <= now)
			.map(|(queue_key, score)| (*score, queue_key.clone()))
			.collect::<Vec<_>>();
		candidates.sort();
		candidates.truncate(limit);

		Ok(candidates.into_iter().map(|(_, key)| key).collect())
	}

	async fn try_claim(
		&self,
		keys: &ClaimKeys,
		in_flight_key: &str,
		now: i64,
		default_env_limit: u32,
	) -> Result<ClaimOutcome> {
		let mut state = self.state.lock().unwrap();

		let Some((score, message_id)) = state
			.queues
			.get(&keys.queue_key)
			.and_then(|q| q.iter().next())
			.cloned()
		else {
			state.refresh_master(&keys.master_queue_key, &keys.queue_key);
			return Ok(ClaimOutcome::Empty);
		};
		if score > now {
			return Ok(ClaimOutcome::Empty);
		}

		let (env_limit, queue_limit) = state.env_and_queue_limits(
			&keys.env_limit_key,
			&keys.queue_limit_key,
			default_env_limit,
		);
		if state.scard(&keys.env_current_key) >= env_limit as u64 {
			return Ok(ClaimOutcome::LimitReached(LimitScope::Environment));
		}
		if state.scard(&keys.queue_current_key) >= queue_limit as u64 {
			return Ok(ClaimOutcome::LimitReached(LimitScope::Queue));
		}

		let message_key = format!("{}{}", keys.message_key_prefix, message_id);
		let Some(body) = state.messages.get(&message_key).cloned() else {
			// Orphaned id with no body; drop it rather than looping on it.
			state.remove_from_queue(&keys.queue_key, &message_id);
			state.refresh_master(&keys.master_queue_key, &keys.queue_key);
			return Ok(ClaimOutcome::Empty);
		};

		let message = serde_json::from_str::<QueueMessage>(&body)
			.context("failed deserializing message body during claim")?;
		let task_current_key =
			format!("{}{}:currentConcurrency", keys.task_key_prefix, message.task_identifier);
		let task_limit_key =
			format!("{}{}:concurrency", keys.task_key_prefix, message.task_identifier);
		if let Some(task_limit) = state.limits.get(&task_limit_key).copied() {
			if state.scard(&task_current_key) >= task_limit as u64 {
				return Ok(ClaimOutcome::LimitReached(LimitScope::Task));
			}
		}

		state.remove_from_queue(&keys.queue_key, &message_id);
		state.sadd(&keys.env_current_key, &message_id);
		state.sadd(&keys.queue_current_key, &message_id);
		state.sadd(&task_current_key, &message_id);
		state.sadd(in_flight_key, &message_id);
		state.consumers.insert(
			format!("{}{}", keys.consumer_key_prefix, message_id),
			in_flight_key.to_string(),
		);
		state.refresh_master(&keys.master_queue_key, &keys.queue_key);

		Ok(ClaimOutcome::Claimed { message_id, body })
	}

	async fn acknowledge(&self, keys: &MessageKeys, message_id: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();

		state.release(keys, message_id);
		state.remove_from_queue(&keys.queue_key, message_id);
		state.messages.remove(&keys.message_key);
		state.refresh_master(&keys.master_queue_key, &keys.queue_key);

		Ok(())
	}

	async fn nack(&self, keys: &MessageKeys, message_id: &str, score: i64) -> Result<()> {
		let mut state = self.state.lock().unwrap();

		state.release(keys, message_id);
		state.remove_from_queue(&keys.queue_key, message_id);
		state
			.queues
			.entry(keys.queue_key.clone())
			.or_default()
			.insert((score, message_id.to_string()));
		state.refresh_master(&keys.master_queue_key, &keys.queue_key);

		Ok(())
	}

	async fn release_concurrency(&self, keys: &MessageKeys, message_id: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state.release(keys, message_id);
		Ok(())
	}

	async fn reacquire_concurrency(
		&self,
		keys: &MessageKeys,
		message_id: &str,
		default_env_limit: u32,
	) -> Result<bool> {
		let mut state = self.state.lock().unwrap();

		// Already holding a slot; nothing to do.
		if state
			.sets
			.get(&keys.env_current_key)
			.map(|s| s.contains(message_id))
			.unwrap_or(false)
		{
			return Ok(true);
		}

		let (env_limit, queue_limit) = state.env_and_queue_limits(
			&keys.env_limit_key,
			&keys.queue_limit_key,
			default_env_limit,
		);
		if state.scard(&keys.env_current_key) >= env_limit as u64 {
			return Ok(false);
		}
		if state.scard(&keys.queue_current_key) >= queue_limit as u64 {
			return Ok(false);
		}
		if let Some(task_limit) = state.limits.get(&keys.task_limit_key).copied() {
			if state.scard(&keys.task_current_key) >= task_limit as u64 {
				return Ok(false);
			}
		}

		state.sadd(&keys.env_current_key, message_id);
		state.sadd(&keys.queue_current_key, message_id);
		state.sadd(&keys.task_current_key, message_id);

		Ok(true)
	}

	async fn read_message(&self, message_key: &str) -> Result<Option<String>> {
		let state = self.state.lock().unwrap();
		Ok(state.messages.get(message_key).cloned())
	}

	async fn set_limit(&self, limit_key: &str, limit: u32) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state.limits.insert(limit_key.to_string(), limit);
		Ok(())
	}

	async fn remove_limit(&self, limit_key: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state.limits.remove(limit_key);
		Ok(())
	}

	async fn get_limit(&self, limit_key: &str) -> Result<Option<u32>> {
		let state = self.state.lock().unwrap();
		Ok(state.limits.get(limit_key).copied())
	}

	async fn queue_length(&self, queue_key: &str) -> Result<u64> {
		let state = self.state.lock().unwrap();
		Ok(state.queues.get(queue_key).map(|q| q.len() as u64).unwrap_or(0))
	}

	async fn set_cardinality(&self, set_key: &str) -> Result<u64> {
		let state = self.state.lock().unwrap();
		Ok(state.scard(set_key))
	}
}
