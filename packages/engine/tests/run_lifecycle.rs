mod common;

use flywheel_runner_protocol::StartAttemptRequest;
use flywheel_types::{
	AttemptCompletion, AttemptStatus, ExecutionStatus, RetryOptions, RunError, RunStatus,
	WaitpointStatus,
};

// MARK: S1, simple run
#[tokio::test]
async fn simple_run_completes_successfully() {
	let ctx = common::TestCtx::new();

	let run = ctx
		.engine
		.trigger(ctx.trigger_request("hello"))
		.await
		.expect("trigger failed");
	assert_eq!(run.status, RunStatus::Pending);

	let snapshots = ctx.engine.db().list_snapshots(run.id).await.unwrap();
	assert_eq!(snapshots[0].execution_status, ExecutionStatus::RunCreated);
	assert_eq!(
		snapshots.last().unwrap().execution_status,
		ExecutionStatus::Queued
	);

	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.expect("expected a message");
	assert_eq!(dequeued.run_id, run.id);
	assert_eq!(dequeued.task_identifier, "hello");

	let started = ctx
		.engine
		.start_attempt(run.id, dequeued.snapshot_id, StartAttemptRequest::default())
		.await
		.expect("start attempt failed");
	assert_eq!(started.attempt_number, 1);
	assert_eq!(started.snapshot.execution_status, ExecutionStatus::Executing);
	assert_eq!(started.env_vars.get("API_URL").unwrap(), "http://localhost");

	let completed = ctx
		.engine
		.complete_attempt(
			run.id,
			started.snapshot.id,
			AttemptCompletion::success("\"hi\""),
		)
		.await
		.expect("complete attempt failed");
	assert_eq!(completed.attempt_status, AttemptStatus::RunFinished);

	let finished = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(finished.status, RunStatus::CompletedSuccessfully);
	assert_eq!(finished.output.as_deref(), Some("\"hi\""));

	// The associated waitpoint resolved with the output.
	let waitpoint = ctx
		.engine
		.db()
		.get_waitpoint(finished.associated_waitpoint_id.unwrap())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(waitpoint.status, WaitpointStatus::Completed);
	assert_eq!(waitpoint.output.as_deref(), Some("\"hi\""));

	// Terminal invariant: nothing left in the queue, nothing blocking.
	assert!(ctx.queue.read_message(run.id).await.unwrap().is_none());
	assert_eq!(
		ctx.engine.db().blocking_waitpoint_count(run.id).await.unwrap(),
		0
	);
}

#[tokio::test]
async fn snapshots_form_a_strictly_ordered_history() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("hello")).await.unwrap();
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
	ctx.engine
		.complete_attempt(run.id, started.snapshot.id, AttemptCompletion::success("1"))
		.await
		.unwrap();

	let snapshots = ctx.engine.db().list_snapshots(run.id).await.unwrap();
	let statuses = snapshots
		.iter()
		.map(|s| s.execution_status)
		.collect::<Vec<_>>();
	assert_eq!(
		statuses,
		vec![
			ExecutionStatus::RunCreated,
			ExecutionStatus::Queued,
			ExecutionStatus::DequeuedForExecution,
			ExecutionStatus::Executing,
			ExecutionStatus::Finished,
		]
	);
	for pair in snapshots.windows(2) {
		assert!(pair[0].created_at <= pair[1].created_at);
	}
}

// MARK: Idempotency
#[tokio::test]
async fn trigger_with_idempotency_key_returns_existing_run() {
	let ctx = common::TestCtx::new();

	let mut request = ctx.trigger_request("hello");
	request.idempotency_key = Some("idem-1".to_string());

	let first = ctx.engine.trigger(request.clone()).await.unwrap();
	let second = ctx.engine.trigger(request).await.unwrap();
	assert_eq!(first.id, second.id);

	// No extra rows or snapshots appeared.
	let snapshots = ctx.engine.db().list_snapshots(first.id).await.unwrap();
	assert_eq!(
		snapshots
			.iter()
			.filter(|s| s.execution_status == ExecutionStatus::RunCreated)
			.count(),
		1
	);
}

// MARK: S4, concurrency cap
#[tokio::test]
async fn queue_concurrency_cap_holds_second_run() {
	let ctx = common::TestCtx::new();

	let mut first_request = ctx.trigger_request("work");
	first_request.queue_name = Some("capped".to_string());
	first_request.queue_concurrency_limit = Some(1);
	let mut second_request = first_request.clone();

	let first = ctx.engine.trigger(first_request).await.unwrap();
	second_request.idempotency_key = None;
	let second = ctx.engine.trigger(second_request).await.unwrap();

	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.expect("first run should dequeue");
	assert_eq!(dequeued.run_id, first.id);

	// The slot is taken; the second run stays queued.
	assert!(ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.is_none());

	let started = ctx
		.engine
		.start_attempt(first.id, dequeued.snapshot_id, StartAttemptRequest::default())
		.await
		.unwrap();
	ctx.engine
		.complete_attempt(first.id, started.snapshot.id, AttemptCompletion::success("1"))
		.await
		.unwrap();

	let next = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.expect("slot freed, second run should dequeue");
	assert_eq!(next.run_id, second.id);
}

// MARK: Retries
#[tokio::test]
async fn short_retry_delay_retries_in_place() {
	let ctx = common::TestCtx::new();

	let mut request = ctx.trigger_request("flaky");
	request.max_attempts = Some(3);
	let run = ctx.engine.trigger(request).await.unwrap();

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

	let completed = ctx
		.engine
		.complete_attempt(
			run.id,
			started.snapshot.id,
			AttemptCompletion::failure(
				RunError::user("boom"),
				Some(RetryOptions { delay_ms: 10 }),
			),
		)
		.await
		.unwrap();
	assert_eq!(completed.attempt_status, AttemptStatus::RetryImmediately);
	assert_eq!(completed.retry_delay_ms, Some(10));
	assert_eq!(
		completed.snapshot.execution_status,
		ExecutionStatus::PendingExecuting
	);

	// The runner starts the next attempt against the new snapshot.
	let restarted = ctx
		.engine
		.start_attempt(
			run.id,
			completed.snapshot.id,
			StartAttemptRequest {
				is_warm_start: true,
				warm_start_count: 1,
			},
		)
		.await
		.unwrap();
	assert_eq!(restarted.attempt_number, 2);
}

#[tokio::test]
async fn long_retry_delay_goes_back_through_the_queue() {
	let ctx = common::TestCtx::new();

	let mut request = ctx.trigger_request("flaky");
	request.max_attempts = Some(2);
	let run = ctx.engine.trigger(request).await.unwrap();

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

	let completed = ctx
		.engine
		.complete_attempt(
			run.id,
			started.snapshot.id,
			AttemptCompletion::failure(
				RunError::user("boom"),
				Some(RetryOptions { delay_ms: 60_000 }),
			),
		)
		.await
		.unwrap();
	assert_eq!(completed.attempt_status, AttemptStatus::RetryQueued);

	let run = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(run.status, RunStatus::Pending);

	// Not available until the retry delay elapses.
	assert!(ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.is_none());
}

#[tokio::test]
async fn exhausted_attempts_complete_with_errors() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("failing")).await.unwrap();
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

	// max_attempts defaults to 1; the retry request is ignored.
	let completed = ctx
		.engine
		.complete_attempt(
			run.id,
			started.snapshot.id,
			AttemptCompletion::failure(
				RunError::user("boom"),
				Some(RetryOptions { delay_ms: 10 }),
			),
		)
		.await
		.unwrap();
	assert_eq!(completed.attempt_status, AttemptStatus::RunFinished);

	let finished = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(finished.status, RunStatus::CompletedWithErrors);
	assert_eq!(finished.error.as_ref().unwrap().message, "boom");

	// Error payload flows into the associated waitpoint.
	let waitpoint = ctx
		.engine
		.db()
		.get_waitpoint(finished.associated_waitpoint_id.unwrap())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(waitpoint.status, WaitpointStatus::Completed);
	assert!(waitpoint.output_is_error);
}

// MARK: Entitlement
#[tokio::test]
async fn out_of_entitlement_creates_no_run() {
	let ctx = common::TestCtx::with_denied_org();

	let err = ctx
		.engine
		.trigger(ctx.trigger_request("blocked"))
		.await
		.expect_err("trigger should be rejected");
	assert!(matches!(
		err.downcast_ref::<flywheel_types::EngineError>(),
		Some(flywheel_types::EngineError::OutOfEntitlement)
	));

	// Nothing was enqueued.
	assert!(ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.is_none());
}

// MARK: Snapshot conflicts
#[tokio::test]
async fn stale_snapshot_id_is_rejected() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("hello")).await.unwrap();
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

	// The dequeue-era snapshot is stale now.
	let err = ctx
		.engine
		.start_attempt(run.id, dequeued.snapshot_id, StartAttemptRequest::default())
		.await
		.expect_err("stale snapshot should be rejected");
	let engine_err = err
		.downcast_ref::<flywheel_types::EngineError>()
		.expect("expected an engine error");
	assert!(engine_err.is_retryable());

	// The live snapshot still completes fine.
	ctx.engine
		.complete_attempt(run.id, started.snapshot.id, AttemptCompletion::success("1"))
		.await
		.unwrap();
}

// MARK: Cancellation
#[tokio::test]
async fn cancel_before_execution_is_immediate() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("hello")).await.unwrap();
	let snapshot = ctx.engine.cancel(run.id).await.unwrap();
	assert_eq!(snapshot.execution_status, ExecutionStatus::Finished);

	let run = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(run.status, RunStatus::Canceled);
	assert!(ctx.queue.read_message(run.id).await.unwrap().is_none());
	assert!(ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.is_none());
}

#[tokio::test]
async fn cancel_during_execution_round_trips_through_the_runner() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("hello")).await.unwrap();
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

	let pending = ctx.engine.cancel(run.id).await.unwrap();
	assert_eq!(pending.execution_status, ExecutionStatus::PendingCancel);

	// A racing success completion loses to the pending cancel.
	let raced = ctx
		.engine
		.complete_attempt(run.id, pending.id, AttemptCompletion::success("1"))
		.await
		.unwrap();
	assert_eq!(raced.attempt_status, AttemptStatus::RunPendingCancel);
	let _ = started;

	// The runner then aborts as instructed.
	let aborted = ctx
		.engine
		.complete_attempt(
			run.id,
			pending.id,
			AttemptCompletion::failure(RunError::aborted("aborted by cancel"), None),
		)
		.await
		.unwrap();
	assert_eq!(aborted.attempt_status, AttemptStatus::RunFinished);

	let finished = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(finished.status, RunStatus::Canceled);
}
