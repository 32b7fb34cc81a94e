mod common;

use std::time::Duration;

use flywheel_runner_protocol::StartAttemptRequest;
use flywheel_types::{
	AttemptCompletion, ExecutionStatus, RunStatus, WaitpointStatus,
};

// MARK: S2, trigger-and-wait
#[tokio::test]
async fn child_completion_resumes_blocked_parent() {
	let ctx = common::TestCtx::new();

	// Parent starts executing.
	let parent = ctx.engine.trigger(ctx.trigger_request("parent")).await.unwrap();
	let parent_dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.unwrap();
	ctx.engine
		.start_attempt(
			parent.id,
			parent_dequeued.snapshot_id,
			StartAttemptRequest::default(),
		)
		.await
		.unwrap();

	// Parent triggers a child and waits on it.
	let mut child_request = ctx.trigger_request("child");
	child_request.parent_run_id = Some(parent.id);
	child_request.resume_parent_on_completion = true;
	let child = ctx.engine.trigger(child_request).await.unwrap();
	assert_eq!(child.parent_run_id, Some(parent.id));
	assert_eq!(child.root_run_id, Some(parent.id));
	assert_eq!(child.depth, 1);

	// Immediately after the trigger the parent is blocked on the child's
	// associated waitpoint.
	let parent_run = ctx.engine.get_run(parent.id).await.unwrap();
	assert_eq!(parent_run.status, RunStatus::WaitingToResume);
	assert_eq!(
		ctx.engine
			.db()
			.blocking_waitpoint_count(parent.id)
			.await
			.unwrap(),
		1
	);
	let parent_snapshot = ctx.engine.db().latest_snapshot(parent.id).await.unwrap().unwrap();
	assert_eq!(
		parent_snapshot.execution_status,
		ExecutionStatus::ExecutingWithWaitpoints
	);

	// Child runs to completion.
	let child_dequeued = ctx
		.engine
		.dequeue_from_master_queue("c2", &ctx.master_queue())
		.await
		.unwrap()
		.expect("child should dequeue");
	assert_eq!(child_dequeued.run_id, child.id);
	let child_started = ctx
		.engine
		.start_attempt(
			child.id,
			child_dequeued.snapshot_id,
			StartAttemptRequest::default(),
		)
		.await
		.unwrap();
	ctx.engine
		.complete_attempt(
			child.id,
			child_started.snapshot.id,
			AttemptCompletion::success("\"child output\""),
		)
		.await
		.unwrap();

	// Parent unblocked in place (runner still attached) and the child's
	// output is delivered with the next execution data.
	let parent_run = ctx.engine.get_run(parent.id).await.unwrap();
	assert_eq!(parent_run.status, RunStatus::Executing);
	assert_eq!(
		ctx.engine
			.db()
			.blocking_waitpoint_count(parent.id)
			.await
			.unwrap(),
		0
	);

	let execution_data = ctx.engine.get_execution_data(parent.id).await.unwrap();
	assert_eq!(
		execution_data.snapshot.execution_status,
		ExecutionStatus::Executing
	);
	assert_eq!(execution_data.completed_waitpoints.len(), 1);
	let delivered = &execution_data.completed_waitpoints[0];
	assert_eq!(delivered.completed_by_run_id, Some(child.id));
	assert_eq!(delivered.output.as_deref(), Some("\"child output\""));
}

// MARK: S3, datetime wait
#[tokio::test]
async fn wait_for_duration_blocks_and_resumes() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("sleeper")).await.unwrap();
	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.unwrap();
	let started = ctx
		.engine
		.start_attempt(run.id, dequeued.snapshot_id, StartAttemptRequest::default())
		.await
		.unwrap();

	let wake_at = flywheel_util::timestamp::now() + 50;
	let wait = ctx
		.engine
		.wait_for_duration(run.id, started.snapshot.id, wake_at)
		.await
		.unwrap();
	assert_eq!(
		wait.snapshot.execution_status,
		ExecutionStatus::ExecutingWithWaitpoints
	);
	assert_eq!(
		ctx.engine.get_run(run.id).await.unwrap().status,
		RunStatus::WaitingToResume
	);

	// Before the wake time the timer does nothing.
	ctx.tick_timers().await;
	assert_eq!(
		ctx.engine.get_run(run.id).await.unwrap().status,
		RunStatus::WaitingToResume
	);

	tokio::time::sleep(Duration::from_millis(80)).await;
	ctx.tick_timers().await;

	// The datetime waitpoint completed and the run resumed in place.
	let waitpoint = ctx
		.engine
		.db()
		.get_waitpoint(wait.waitpoint_id)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(waitpoint.status, WaitpointStatus::Completed);
	let resumed = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(resumed.status, RunStatus::Executing);
}

// MARK: Suspension
#[tokio::test]
async fn suspended_runner_resumes_through_continue() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("sleeper")).await.unwrap();
	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.unwrap();
	let started = ctx
		.engine
		.start_attempt(run.id, dequeued.snapshot_id, StartAttemptRequest::default())
		.await
		.unwrap();

	let wake_at = flywheel_util::timestamp::now() + 50;
	let wait = ctx
		.engine
		.wait_for_duration(run.id, started.snapshot.id, wake_at)
		.await
		.unwrap();

	// The runner asks to shut down while blocked.
	let suspended = ctx
		.engine
		.suspend_run(run.id, wait.snapshot.id)
		.await
		.unwrap();
	assert!(suspended.ok);
	let snapshot = ctx.engine.db().latest_snapshot(run.id).await.unwrap().unwrap();
	assert_eq!(snapshot.execution_status, ExecutionStatus::Suspended);

	tokio::time::sleep(Duration::from_millis(80)).await;
	ctx.tick_timers().await;

	// Unblocked while suspended: the platform waits for the runner to
	// continue.
	let snapshot = ctx.engine.db().latest_snapshot(run.id).await.unwrap().unwrap();
	assert_eq!(snapshot.execution_status, ExecutionStatus::PendingExecuting);
	assert_eq!(snapshot.completed_waitpoint_ids, vec![wait.waitpoint_id]);

	let continued = ctx
		.engine
		.continue_run_execution(run.id, snapshot.id)
		.await
		.unwrap();
	assert_eq!(
		continued.snapshot.execution_status,
		ExecutionStatus::Executing
	);
	assert_eq!(continued.completed_waitpoints.len(), 1);
}

#[tokio::test]
async fn suspension_is_declined_once_waitpoints_complete() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("sleeper")).await.unwrap();
	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.unwrap();
	let started = ctx
		.engine
		.start_attempt(run.id, dequeued.snapshot_id, StartAttemptRequest::default())
		.await
		.unwrap();

	let wake_at = flywheel_util::timestamp::now() + 20;
	let wait = ctx
		.engine
		.wait_for_duration(run.id, started.snapshot.id, wake_at)
		.await
		.unwrap();

	tokio::time::sleep(Duration::from_millis(50)).await;
	ctx.tick_timers().await;

	// The run already resumed; a late suspend request is declined with a
	// snapshot conflict or a decline, never a suspension.
	match ctx.engine.suspend_run(run.id, wait.snapshot.id).await {
		Ok(response) => assert!(!response.ok),
		Err(err) => {
			assert!(err.downcast_ref::<flywheel_types::EngineError>().is_some());
		}
	}
}

// MARK: Delayed runs
#[tokio::test]
async fn delayed_run_enqueues_after_the_delay_elapses() {
	let ctx = common::TestCtx::new();

	let mut request = ctx.trigger_request("later");
	request.delay_until = Some(flywheel_util::timestamp::now() + 50);
	let run = ctx.engine.trigger(request).await.unwrap();
	assert_eq!(run.status, RunStatus::Delayed);

	// Nothing to dequeue yet.
	assert!(ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.is_none());

	tokio::time::sleep(Duration::from_millis(80)).await;
	ctx.tick_timers().await;

	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.expect("delayed run should be dequeueable after the delay");
	assert_eq!(dequeued.run_id, run.id);
}

// MARK: Waitpoint idempotence
#[tokio::test]
async fn completing_a_waitpoint_twice_is_a_no_op() {
	let ctx = common::TestCtx::new();

	let waitpoint = ctx
		.engine
		.create_manual_waitpoint(ctx.env.project_id, None)
		.await
		.unwrap();

	ctx.engine
		.complete_waitpoint(waitpoint.id, Some("\"first\"".to_string()), false)
		.await
		.unwrap();
	ctx.engine
		.complete_waitpoint(waitpoint.id, Some("\"second\"".to_string()), false)
		.await
		.unwrap();

	// The first completion wins; Completed is terminal.
	let stored = ctx.engine.db().get_waitpoint(waitpoint.id).await.unwrap().unwrap();
	assert_eq!(stored.status, WaitpointStatus::Completed);
	assert_eq!(stored.output.as_deref(), Some("\"first\""));
}

#[tokio::test]
async fn datetime_waitpoints_dedupe_on_idempotency_key() {
	let ctx = common::TestCtx::new();

	let wake_at = flywheel_util::timestamp::now() + 60_000;
	let first = ctx
		.engine
		.create_date_time_waitpoint(ctx.env.project_id, wake_at, Some("wp-key".to_string()))
		.await
		.unwrap();
	let second = ctx
		.engine
		.create_date_time_waitpoint(ctx.env.project_id, wake_at, Some("wp-key".to_string()))
		.await
		.unwrap();
	assert_eq!(first.id, second.id);
}
