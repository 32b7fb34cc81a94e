use std::str::FromStr;

use anyhow::{Context, Result, bail};
use flywheel_types::{Environment, EnvironmentType};
use flywheel_util::Id;

/// Canonical name of the shared master queue all deployed environments pull
/// from.
pub const SHARED_QUEUE: &str = "sharedQueue";

/// Produces every queue/concurrency key in the shared KV store.
///
/// Tenancy is embedded in the key path so a single SCAN pattern recovers all
/// queues for a tenant, and so any key can be derived from the queue key
/// without re-reading state.
#[derive(Clone, Debug)]
pub struct KeyProducer {
	prefix: String,
}

impl KeyProducer {
	pub fn new(prefix: impl Into<String>) -> Self {
		KeyProducer {
			prefix: prefix.into(),
		}
	}

	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	// MARK: Environment keys
	pub fn env_key(&self, env: &Environment) -> String {
		format!(
			"{}org:{}:proj:{}:envType:{}:env:{}",
			self.prefix, env.organization_id, env.project_id, env.env_type, env.id
		)
	}

	pub fn env_current_concurrency_key(&self, env_key: &str) -> String {
		format!("{env_key}:currentConcurrency")
	}

	pub fn env_concurrency_limit_key(&self, env_key: &str) -> String {
		format!("{env_key}:concurrency")
	}

	// MARK: Queue keys
	pub fn queue_key(&self, env: &Environment, queue: &str, concurrency_key: Option<&str>) -> String {
		match concurrency_key {
			Some(ck) => format!("{}:queue:{}:ck:{}", self.env_key(env), queue, ck),
			None => format!("{}:queue:{}", self.env_key(env), queue),
		}
	}

	/// Current-concurrency set for the (sub-)queue. Includes the concurrency
	/// key so each logical sub-queue has its own counter.
	pub fn queue_current_concurrency_key(&self, queue_key: &str) -> String {
		format!("{queue_key}:currentConcurrency")
	}

	/// Limit for the named queue. Sub-queues share the named queue's limit
	/// value, so the `:ck:` suffix is stripped first.
	pub fn queue_concurrency_limit_key(&self, queue_key: &str) -> String {
		format!("{}:concurrency", strip_concurrency_key(queue_key))
	}

	// MARK: Task keys
	pub fn task_current_concurrency_key(&self, env_key: &str, task_identifier: &str) -> String {
		format!("{env_key}:task:{task_identifier}:currentConcurrency")
	}

	pub fn task_concurrency_limit_key(&self, env_key: &str, task_identifier: &str) -> String {
		format!("{env_key}:task:{task_identifier}:concurrency")
	}

	/// Prefix drivers combine with a task identifier and counter suffix when
	/// the identifier is only known from the message body.
	pub fn task_key_prefix(&self, env_key: &str) -> String {
		format!("{env_key}:task:")
	}

	// MARK: Master queues
	/// The master-queue *name* an environment pulls from. Development
	/// environments get an isolated shared queue; everything else shares one.
	pub fn master_queue_name(&self, env: &Environment) -> String {
		if env.env_type.uses_isolated_master_queue() {
			format!(
				"org:{}:proj:{}:envType:{}:env:{}:{}",
				env.organization_id, env.project_id, env.env_type, env.id, SHARED_QUEUE
			)
		} else {
			SHARED_QUEUE.to_string()
		}
	}

	pub fn master_queue_key(&self, master_queue: &str) -> String {
		format!("{}{}", self.prefix, master_queue)
	}

	// MARK: Messages
	pub fn message_key(&self, message_id: &str) -> String {
		format!("{}message:{}", self.prefix, message_id)
	}

	pub fn message_key_prefix(&self) -> String {
		format!("{}message:", self.prefix)
	}

	pub fn message_consumer_key(&self, message_id: &str) -> String {
		format!("{}messageConsumer:{}", self.prefix, message_id)
	}

	pub fn message_consumer_key_prefix(&self) -> String {
		format!("{}messageConsumer:", self.prefix)
	}

	pub fn in_flight_key(&self, consumer_id: &str) -> String {
		format!("{}inFlight:{}", self.prefix, consumer_id)
	}

	pub fn in_flight_key_prefix(&self) -> String {
		format!("{}inFlight:", self.prefix)
	}

	// MARK: Derivation
	/// Environment key derived from any queue key without re-reading state.
	pub fn env_key_from_queue_key(&self, queue_key: &str) -> Result<String> {
		let (env_key, _) = queue_key
			.split_once(":queue:")
			.context("queue key missing :queue: segment")?;
		Ok(env_key.to_string())
	}

	pub fn parse_queue_key(&self, queue_key: &str) -> Result<ParsedQueueKey> {
		let stripped = queue_key
			.strip_prefix(&self.prefix)
			.context("queue key missing prefix")?;

		let rest = match stripped.strip_prefix("org:") {
			Some(rest) => rest,
			None => bail!("queue key missing org segment: {queue_key}"),
		};
		let (org, rest) = rest
			.split_once(":proj:")
			.context("queue key missing proj segment")?;
		let (project, rest) = rest
			.split_once(":envType:")
			.context("queue key missing envType segment")?;
		let (env_type, rest) = rest
			.split_once(":env:")
			.context("queue key missing env segment")?;
		let (env, rest) = rest
			.split_once(":queue:")
			.context("queue key missing queue segment")?;

		let (queue_name, concurrency_key) = match rest.split_once(":ck:") {
			Some((q, ck)) => (q.to_string(), Some(ck.to_string())),
			None => (rest.to_string(), None),
		};

		Ok(ParsedQueueKey {
			organization_id: org.parse().context("invalid org id in queue key")?,
			project_id: project.parse().context("invalid project id in queue key")?,
			env_type: EnvironmentType::from_str(env_type)
				.context("invalid env type in queue key")?,
			environment_id: env.parse().context("invalid env id in queue key")?,
			queue_name,
			concurrency_key,
		})
	}
}

/// Tenancy recovered from a queue key.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQueueKey {
	pub organization_id: Id,
	pub project_id: Id,
	pub env_type: EnvironmentType,
	pub environment_id: Id,
	pub queue_name: String,
	pub concurrency_key: Option<String>,
}

fn strip_concurrency_key(queue_key: &str) -> &str {
	match queue_key.split_once(":ck:") {
		Some((named, _)) => named,
		None => queue_key,
	}
}

/// Queue names are embedded in key paths, so the separator charset is
/// reserved.
pub fn validate_queue_name(name: &str) -> Result<()> {
	if name.is_empty() {
		bail!("queue name cannot be empty");
	}
	if name.len() > 128 {
		bail!("queue name too long (max 128): {name}");
	}
	if !name
		.chars()
		.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'))
	{
		bail!("queue name contains reserved characters: {name}");
	}
	Ok(())
}
