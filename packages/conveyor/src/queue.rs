use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use flywheel_types::{Environment, QueueMessage};
use flywheel_util::Id;

use crate::driver::{ClaimKeys, ClaimOutcome, LimitScope, MessageKeys, QueueDriverHandle};
use crate::fair::FairPriorityStrategy;
use crate::keys::{KeyProducer, validate_queue_name};

/// How many master-queue members are read per dequeue pass. Selection then
/// narrows via the fair strategies.
const MASTER_QUEUE_SCAN_LIMIT: usize = 128;

pub struct RunQueueInner {
	config: flywheel_config::Config,
	keys: KeyProducer,
	driver: QueueDriverHandle,
	env_strategy: Mutex<FairPriorityStrategy>,
	queue_strategy: Mutex<FairPriorityStrategy>,
}

/// The fair, weighted, multi-tenant run queue. All state lives behind the
/// driver; this facade owns key derivation and candidate selection.
#[derive(Clone)]
pub struct RunQueue(Arc<RunQueueInner>);

impl Deref for RunQueue {
	type Target = RunQueueInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl RunQueue {
	pub fn new(config: flywheel_config::Config, driver: QueueDriverHandle) -> Self {
		let queue_config = config.queue();
		let env_strategy = FairPriorityStrategy::new(
			queue_config.env_candidate_sample_size(),
			queue_config.selection_decay_interval(),
		);
		let queue_strategy = FairPriorityStrategy::new(
			queue_config.queue_candidate_sample_size(),
			queue_config.selection_decay_interval(),
		);

		RunQueue(Arc::new(RunQueueInner {
			keys: KeyProducer::new(queue_config.prefix()),
			config,
			driver,
			env_strategy: Mutex::new(env_strategy),
			queue_strategy: Mutex::new(queue_strategy),
		}))
	}

	pub fn keys(&self) -> &KeyProducer {
		&self.keys
	}

	/// Master queue this environment's supervisors pull from.
	pub fn master_queue_name(&self, env: &Environment) -> String {
		self.keys.master_queue_name(env)
	}

	// MARK: Enqueue
	#[tracing::instrument(skip_all, fields(run_id=%message.run_id, queue=%message.queue_name))]
	pub async fn enqueue_message(
		&self,
		env: &Environment,
		master_queue: &str,
		message: &QueueMessage,
		available_at: i64,
		priority_ms: i64,
	) -> Result<()> {
		validate_queue_name(&message.queue_name)?;

		// Keep the env limit fresh; enqueue is the chokepoint every run
		// passes through.
		self.update_env_concurrency_limits(env).await?;

		let keys = self.message_keys(env, message, master_queue);
		let message_id = message.run_id.to_string();
		let body = serde_json::to_string(message).context("failed serializing message")?;
		let score = available_at + priority_ms;

		self.driver.enqueue(&keys, &message_id, &body, score).await?;

		tracing::debug!(score, "enqueued message");

		Ok(())
	}

	// MARK: Dequeue
	/// Two-level fair selection: environment first, then queue within the
	/// environment. Each claim attempt is a single atomic driver call, so
	/// budgets can never be exceeded even with parallel consumers.
	#[tracing::instrument(skip_all, fields(%consumer_id, %master_queue))]
	pub async fn dequeue_message_in_shared_queue(
		&self,
		consumer_id: &str,
		master_queue: &str,
	) -> Result<Option<QueueMessage>> {
		let now = flywheel_util::timestamp::now();
		let master_queue_key = self.keys.master_queue_key(master_queue);
		let in_flight_key = self.keys.in_flight_key(consumer_id);
		let default_env_limit = self.config.queue().default_env_concurrency_limit();

		let candidates = self
			.driver
			.master_queue_candidates(&master_queue_key, now, MASTER_QUEUE_SCAN_LIMIT)
			.await?;
		if candidates.is_empty() {
			return Ok(None);
		}

		// Group queue keys by their owning environment.
		let mut by_env = HashMap::<String, Vec<String>>::new();
		for queue_key in candidates {
			let env_key = self.keys.env_key_from_queue_key(&queue_key)?;
			by_env.entry(env_key).or_default().push(queue_key);
		}

		while !by_env.is_empty() {
			let env_keys = by_env.keys().cloned().collect::<Vec<_>>();
			let Some(env_key) = self.env_strategy.lock().unwrap().choose(&env_keys) else {
				break;
			};

			let mut queues = by_env.remove(&env_key).unwrap_or_default();
			let mut env_exhausted = false;

			while !queues.is_empty() && !env_exhausted {
				let Some(queue_key) = self.queue_strategy.lock().unwrap().choose(&queues) else {
					break;
				};
				queues.retain(|q| q != &queue_key);

				let keys = self.claim_keys(&queue_key, &master_queue_key)?;
				match self
					.driver
					.try_claim(&keys, &in_flight_key, now, default_env_limit)
					.await?
				{
					ClaimOutcome::Claimed { message_id, body } => {
						let message = serde_json::from_str::<QueueMessage>(&body)
							.context("failed deserializing message body")?;
						tracing::debug!(%message_id, queue=%message.queue_name, "dequeued message");
						return Ok(Some(message));
					}
					ClaimOutcome::LimitReached(LimitScope::Environment) => {
						// Nothing else in this environment can be claimed
						// this pass.
						env_exhausted = true;
					}
					ClaimOutcome::LimitReached(_) | ClaimOutcome::Empty => {}
				}
			}
		}

		Ok(None)
	}

	// MARK: Acknowledge / nack
	/// Drops the message and its concurrency slots. Safe to call repeatedly;
	/// a missing body means the message is already gone.
	#[tracing::instrument(skip_all, fields(%message_id))]
	pub async fn acknowledge_message(&self, message_id: Id) -> Result<()> {
		let Some((_, keys)) = self.load_message_keys(message_id).await? else {
			tracing::debug!("acknowledge for unknown message, ignoring");
			return Ok(());
		};

		self.driver
			.acknowledge(&keys, &message_id.to_string())
			.await?;

		Ok(())
	}

	/// Releases concurrency and puts the message back in its queue at
	/// `retry_at` (defaults to now). Returns false when the body no longer
	/// exists.
	#[tracing::instrument(skip_all, fields(%message_id))]
	pub async fn nack_message(&self, message_id: Id, retry_at: Option<i64>) -> Result<bool> {
		let Some((_, keys)) = self.load_message_keys(message_id).await? else {
			tracing::debug!("nack for unknown message, ignoring");
			return Ok(false);
		};

		let score = retry_at.unwrap_or_else(flywheel_util::timestamp::now);
		self.driver
			.nack(&keys, &message_id.to_string(), score)
			.await?;

		Ok(true)
	}

	// MARK: Suspension support
	/// Frees the message's concurrency slots without touching the body or
	/// queue position. Used when a run blocks on waitpoints.
	#[tracing::instrument(skip_all, fields(%message_id))]
	pub async fn release_concurrency(&self, message_id: Id) -> Result<()> {
		let Some((_, keys)) = self.load_message_keys(message_id).await? else {
			return Ok(());
		};

		self.driver
			.release_concurrency(&keys, &message_id.to_string())
			.await?;

		Ok(())
	}

	/// Attempts to re-claim the message's concurrency slots after a resume.
	/// Returns false when a budget would be exceeded; the caller must
	/// re-queue instead.
	#[tracing::instrument(skip_all, fields(%message_id))]
	pub async fn reacquire_concurrency(&self, message_id: Id) -> Result<bool> {
		let Some((_, keys)) = self.load_message_keys(message_id).await? else {
			return Ok(false);
		};

		self.driver
			.reacquire_concurrency(
				&keys,
				&message_id.to_string(),
				self.config.queue().default_env_concurrency_limit(),
			)
			.await
	}

	// MARK: Limits
	pub async fn update_queue_concurrency_limits(
		&self,
		env: &Environment,
		queue_name: &str,
		limit: u32,
	) -> Result<()> {
		let queue_key = self.keys.queue_key(env, queue_name, None);
		// A queue can never exceed its environment, so clamp up front.
		let limit = limit.min(env.concurrency_limit);
		self.driver
			.set_limit(&self.keys.queue_concurrency_limit_key(&queue_key), limit)
			.await
	}

	pub async fn remove_queue_concurrency_limits(
		&self,
		env: &Environment,
		queue_name: &str,
	) -> Result<()> {
		let queue_key = self.keys.queue_key(env, queue_name, None);
		self.driver
			.remove_limit(&self.keys.queue_concurrency_limit_key(&queue_key))
			.await
	}

	pub async fn set_task_concurrency_limit(
		&self,
		env: &Environment,
		task_identifier: &str,
		limit: u32,
	) -> Result<()> {
		let env_key = self.keys.env_key(env);
		self.driver
			.set_limit(
				&self.keys.task_concurrency_limit_key(&env_key, task_identifier),
				limit,
			)
			.await
	}

	pub async fn remove_task_concurrency_limit(
		&self,
		env: &Environment,
		task_identifier: &str,
	) -> Result<()> {
		let env_key = self.keys.env_key(env);
		self.driver
			.remove_limit(&self.keys.task_concurrency_limit_key(&env_key, task_identifier))
			.await
	}

	pub async fn update_env_concurrency_limits(&self, env: &Environment) -> Result<()> {
		let env_key = self.keys.env_key(env);
		self.driver
			.set_limit(
				&self.keys.env_concurrency_limit_key(&env_key),
				env.concurrency_limit,
			)
			.await
	}

	// MARK: Introspection
	pub async fn length_of_queue(&self, env: &Environment, queue_name: &str) -> Result<u64> {
		let queue_key = self.keys.queue_key(env, queue_name, None);
		self.driver.queue_length(&queue_key).await
	}

	pub async fn current_concurrency_of_queue(
		&self,
		env: &Environment,
		queue_name: &str,
		concurrency_key: Option<&str>,
	) -> Result<u64> {
		let queue_key = self.keys.queue_key(env, queue_name, concurrency_key);
		self.driver
			.set_cardinality(&self.keys.queue_current_concurrency_key(&queue_key))
			.await
	}

	pub async fn current_concurrency_of_environment(&self, env: &Environment) -> Result<u64> {
		let env_key = self.keys.env_key(env);
		self.driver
			.set_cardinality(&self.keys.env_current_concurrency_key(&env_key))
			.await
	}

	pub async fn read_message(&self, message_id: Id) -> Result<Option<QueueMessage>> {
		let message_key = self.keys.message_key(&message_id.to_string());
		let Some(body) = self.driver.read_message(&message_key).await? else {
			return Ok(None);
		};
		let message =
			serde_json::from_str(&body).context("failed deserializing message body")?;
		Ok(Some(message))
	}

	// MARK: Key derivation
	fn message_keys(
		&self,
		env: &Environment,
		message: &QueueMessage,
		master_queue: &str,
	) -> MessageKeys {
		let queue_key = self.keys.queue_key(
			env,
			&message.queue_name,
			message.concurrency_key.as_deref(),
		);
		let env_key = self.keys.env_key(env);
		let message_id = message.run_id.to_string();

		MessageKeys {
			master_queue_key: self.keys.master_queue_key(master_queue),
			message_key: self.keys.message_key(&message_id),
			consumer_key: self.keys.message_consumer_key(&message_id),
			env_current_key: self.keys.env_current_concurrency_key(&env_key),
			env_limit_key: self.keys.env_concurrency_limit_key(&env_key),
			queue_current_key: self.keys.queue_current_concurrency_key(&queue_key),
			queue_limit_key: self.keys.queue_concurrency_limit_key(&queue_key),
			task_current_key: self
				.keys
				.task_current_concurrency_key(&env_key, &message.task_identifier),
			task_limit_key: self
				.keys
				.task_concurrency_limit_key(&env_key, &message.task_identifier),
			queue_key,
		}
	}

	/// Key set for a claim attempt, derived from the queue key alone. Keys
	/// that depend on the popped message id are derived inside the driver
	/// from the prefixes.
	fn claim_keys(&self, queue_key: &str, master_queue_key: &str) -> Result<ClaimKeys> {
		let env_key = self.keys.env_key_from_queue_key(queue_key)?;

		Ok(ClaimKeys {
			queue_key: queue_key.to_string(),
			master_queue_key: master_queue_key.to_string(),
			env_current_key: self.keys.env_current_concurrency_key(&env_key),
			env_limit_key: self.keys.env_concurrency_limit_key(&env_key),
			queue_current_key: self.keys.queue_current_concurrency_key(queue_key),
			queue_limit_key: self.keys.queue_concurrency_limit_key(queue_key),
			task_key_prefix: self.keys.task_key_prefix(&env_key),
			message_key_prefix: self.keys.message_key_prefix(),
			consumer_key_prefix: self.keys.message_consumer_key_prefix(),
		})
	}

	async fn load_message_keys(
		&self,
		message_id: Id,
	) -> Result<Option<(QueueMessage, MessageKeys)>> {
		let Some(message) = self.read_message(message_id).await? else {
			return Ok(None);
		};

		let env = Environment {
			id: message.environment_id,
			organization_id: message.organization_id,
			project_id: message.project_id,
			env_type: message.environment_type,
			// Limits are read from their keys, not from this value.
			concurrency_limit: 0,
			env_vars: Default::default(),
		};
		let master_queue = self.keys.master_queue_name(&env);
		let keys = self.message_keys(&env, &message, &master_queue);

		Ok(Some((message, keys)))
	}
}
