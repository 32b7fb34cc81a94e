use std::collections::HashMap;
use std::sync::Arc;

use conveyor::{MemoryDriver, RunQueue};
use flywheel_config::Config;
use flywheel_types::{Environment, EnvironmentType, QueueMessage};
use flywheel_util::Id;

fn test_queue() -> RunQueue {
	let config = Config::from_root(Default::default());
	RunQueue::new(config, Arc::new(MemoryDriver::new()))
}

fn test_env(env_type: EnvironmentType, concurrency_limit: u32) -> Environment {
	Environment {
		id: Id::new(),
		organization_id: Id::new(),
		project_id: Id::new(),
		env_type,
		concurrency_limit,
		env_vars: HashMap::new(),
	}
}

fn test_message(env: &Environment, queue_name: &str, task: &str) -> QueueMessage {
	QueueMessage {
		run_id: Id::new(),
		task_identifier: task.to_string(),
		organization_id: env.organization_id,
		project_id: env.project_id,
		environment_id: env.id,
		environment_type: env.env_type,
		queue_name: queue_name.to_string(),
		concurrency_key: None,
		enqueued_at: flywheel_util::timestamp::now(),
		attempt_count: 0,
	}
}

async fn enqueue(queue: &RunQueue, env: &Environment, message: &QueueMessage) {
	let master = queue.master_queue_name(env);
	queue
		.enqueue_message(env, &master, message, flywheel_util::timestamp::now(), 0)
		.await
		.expect("enqueue failed");
}

#[tokio::test]
async fn enqueue_then_dequeue_returns_message() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	let message = test_message(&env, "default", "hello");

	enqueue(&queue, &env, &message).await;

	let dequeued = queue
		.dequeue_message_in_shared_queue("c1", &queue.master_queue_name(&env))
		.await
		.unwrap()
		.expect("expected a message");
	assert_eq!(dequeued.run_id, message.run_id);
	assert_eq!(dequeued.queue_name, "default");

	// Queue is drained.
	let empty = queue
		.dequeue_message_in_shared_queue("c1", &queue.master_queue_name(&env))
		.await
		.unwrap();
	assert!(empty.is_none());
}

#[tokio::test]
async fn queue_concurrency_limit_gates_second_dequeue() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	queue
		.update_queue_concurrency_limits(&env, "capped", 1)
		.await
		.unwrap();

	let first = test_message(&env, "capped", "task-a");
	let second = test_message(&env, "capped", "task-a");
	enqueue(&queue, &env, &first).await;
	enqueue(&queue, &env, &second).await;

	let master = queue.master_queue_name(&env);
	let dequeued = queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("first dequeue should succeed");
	assert_eq!(dequeued.run_id, first.run_id);

	// Second message stays queued until the slot frees.
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_none());

	queue.acknowledge_message(first.run_id).await.unwrap();

	let resumed = queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("slot freed, second dequeue should succeed");
	assert_eq!(resumed.run_id, second.run_id);
}

#[tokio::test]
async fn env_concurrency_limit_spans_queues() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 1);

	let first = test_message(&env, "q-one", "task-a");
	let second = test_message(&env, "q-two", "task-b");
	enqueue(&queue, &env, &first).await;
	enqueue(&queue, &env, &second).await;

	let master = queue.master_queue_name(&env);
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_some());
	// Both queues live in the same environment; its single slot is taken.
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_none());
	assert_eq!(queue.current_concurrency_of_environment(&env).await.unwrap(), 1);
}

#[tokio::test]
async fn acknowledge_is_idempotent() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	let message = test_message(&env, "default", "hello");
	enqueue(&queue, &env, &message).await;

	let master = queue.master_queue_name(&env);
	queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("dequeue");
	assert_eq!(queue.current_concurrency_of_environment(&env).await.unwrap(), 1);

	queue.acknowledge_message(message.run_id).await.unwrap();
	queue.acknowledge_message(message.run_id).await.unwrap();

	assert_eq!(queue.current_concurrency_of_environment(&env).await.unwrap(), 0);
	assert!(queue.read_message(message.run_id).await.unwrap().is_none());
}

#[tokio::test]
async fn nack_requeues_and_frees_concurrency() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	let message = test_message(&env, "default", "hello");
	enqueue(&queue, &env, &message).await;

	let master = queue.master_queue_name(&env);
	queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("dequeue");

	assert!(queue.nack_message(message.run_id, None).await.unwrap());
	assert_eq!(queue.current_concurrency_of_environment(&env).await.unwrap(), 0);

	let again = queue
		.dequeue_message_in_shared_queue("c2", &master)
		.await
		.unwrap()
		.expect("nacked message should be dequeuable again");
	assert_eq!(again.run_id, message.run_id);
}

#[tokio::test]
async fn release_then_reacquire_round_trips() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	let message = test_message(&env, "default", "hello");
	enqueue(&queue, &env, &message).await;

	let master = queue.master_queue_name(&env);
	queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("dequeue");

	// Blocking on a waitpoint frees the slot but keeps the body.
	queue.release_concurrency(message.run_id).await.unwrap();
	assert_eq!(queue.current_concurrency_of_environment(&env).await.unwrap(), 0);
	assert!(queue.read_message(message.run_id).await.unwrap().is_some());

	assert!(queue.reacquire_concurrency(message.run_id).await.unwrap());
	assert_eq!(queue.current_concurrency_of_environment(&env).await.unwrap(), 1);

	// Reacquire while already holding is a no-op, not a double count.
	assert!(queue.reacquire_concurrency(message.run_id).await.unwrap());
	assert_eq!(queue.current_concurrency_of_environment(&env).await.unwrap(), 1);
}

#[tokio::test]
async fn reacquire_fails_when_queue_is_full() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	queue
		.update_queue_concurrency_limits(&env, "capped", 1)
		.await
		.unwrap();

	let blocked = test_message(&env, "capped", "task-a");
	let active = test_message(&env, "capped", "task-a");
	enqueue(&queue, &env, &blocked).await;

	let master = queue.master_queue_name(&env);
	queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("dequeue");
	queue.release_concurrency(blocked.run_id).await.unwrap();

	// Another run takes the only slot while the first is blocked.
	enqueue(&queue, &env, &active).await;
	queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("dequeue of second message");

	assert!(!queue.reacquire_concurrency(blocked.run_id).await.unwrap());
}

#[tokio::test]
async fn concurrency_key_partitions_a_queue() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	queue
		.update_queue_concurrency_limits(&env, "per-user", 1)
		.await
		.unwrap();

	let mut for_user_a = test_message(&env, "per-user", "task-a");
	for_user_a.concurrency_key = Some("user-a".to_string());
	let mut for_user_b = test_message(&env, "per-user", "task-a");
	for_user_b.concurrency_key = Some("user-b".to_string());

	enqueue(&queue, &env, &for_user_a).await;
	enqueue(&queue, &env, &for_user_b).await;

	let master = queue.master_queue_name(&env);
	// Each sub-queue has its own slot under the shared limit value.
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_some());
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_some());
}

#[tokio::test]
async fn task_concurrency_limit_gates_dequeue() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);

	// Same task across two queues; task budget of 1.
	let first = test_message(&env, "q-one", "throttled-task");
	let second = test_message(&env, "q-two", "throttled-task");
	enqueue(&queue, &env, &first).await;
	enqueue(&queue, &env, &second).await;

	queue
		.set_task_concurrency_limit(&env, "throttled-task", 1)
		.await
		.unwrap();

	let master = queue.master_queue_name(&env);
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_some());
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_none());
}

#[tokio::test]
async fn dev_environments_do_not_share_the_master_queue() {
	let queue = test_queue();
	let dev = test_env(EnvironmentType::Development, 10);
	let prod = test_env(EnvironmentType::Production, 10);

	let dev_message = test_message(&dev, "default", "hello");
	enqueue(&queue, &dev, &dev_message).await;

	// A deployed supervisor polling the shared queue never sees dev work.
	assert!(queue
		.dequeue_message_in_shared_queue("c1", &queue.master_queue_name(&prod))
		.await
		.unwrap()
		.is_none());

	let dequeued = queue
		.dequeue_message_in_shared_queue("dev-c1", &queue.master_queue_name(&dev))
		.await
		.unwrap()
		.expect("dev supervisor should see dev work");
	assert_eq!(dequeued.run_id, dev_message.run_id);
}

#[tokio::test]
async fn fairness_across_environments() {
	let queue = test_queue();
	let env_a = test_env(EnvironmentType::Production, 100);
	let env_b = test_env(EnvironmentType::Production, 100);
	let master = queue.master_queue_name(&env_a);

	for _ in 0..40 {
		enqueue(&queue, &env_a, &test_message(&env_a, "default", "task-a")).await;
		enqueue(&queue, &env_b, &test_message(&env_b, "default", "task-b")).await;
	}

	let mut by_env = HashMap::<Id, u32>::new();
	for i in 0..40 {
		let message = queue
			.dequeue_message_in_shared_queue(&format!("c{i}"), &master)
			.await
			.unwrap()
			.expect("both envs have work");
		*by_env.entry(message.environment_id).or_insert(0) += 1;
		queue.acknowledge_message(message.run_id).await.unwrap();
	}

	let share_a = *by_env.get(&env_a.id).unwrap_or(&0);
	// Weighted-random selection should not starve either tenant.
	assert!(
		(8..=32).contains(&share_a),
		"environment share {share_a}/40 outside fairness bounds"
	);
}

#[tokio::test]
async fn delayed_message_not_dequeued_before_available_at() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	let message = test_message(&env, "default", "hello");

	let master = queue.master_queue_name(&env);
	queue
		.enqueue_message(
			&env,
			&master,
			&message,
			flywheel_util::timestamp::now() + 60_000,
			0,
		)
		.await
		.unwrap();

	assert!(queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.is_none());
}

#[tokio::test]
async fn priority_offset_orders_within_a_queue() {
	let queue = test_queue();
	let env = test_env(EnvironmentType::Production, 10);
	let master = queue.master_queue_name(&env);
	let now = flywheel_util::timestamp::now();

	let normal = test_message(&env, "default", "hello");
	let urgent = test_message(&env, "default", "hello");
	queue
		.enqueue_message(&env, &master, &normal, now, 0)
		.await
		.unwrap();
	// Enqueued later but with a negative priority offset.
	queue
		.enqueue_message(&env, &master, &urgent, now + 1, -10_000)
		.await
		.unwrap();

	let first = queue
		.dequeue_message_in_shared_queue("c1", &master)
		.await
		.unwrap()
		.expect("dequeue");
	assert_eq!(first.run_id, urgent.run_id);
}
