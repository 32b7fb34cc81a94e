mod common;

use std::time::Duration;

use flywheel_runner_protocol::StartAttemptRequest;
use flywheel_types::{AttemptCompletion, ExecutionStatus, RunStatus, WaitpointStatus};

// MARK: S6, ttl expiry
#[tokio::test]
async fn undequeued_run_expires_after_ttl() {
	let ctx = common::TestCtx::new();

	let mut request = ctx.trigger_request("short-lived");
	request.ttl_ms = Some(50);
	let run = ctx.engine.trigger(request).await.unwrap();

	tokio::time::sleep(Duration::from_millis(80)).await;
	ctx.tick_timers().await;

	let expired = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(expired.status, RunStatus::Expired);

	// Removed from the queue and the waitpoint carries the expiry error.
	assert!(ctx.queue.read_message(run.id).await.unwrap().is_none());
	assert!(ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.is_none());
	let waitpoint = ctx
		.engine
		.db()
		.get_waitpoint(expired.associated_waitpoint_id.unwrap())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(waitpoint.status, WaitpointStatus::Completed);
	assert!(waitpoint.output_is_error);
}

#[tokio::test]
async fn ttl_does_not_expire_a_run_that_started() {
	let ctx = common::TestCtx::new();

	let mut request = ctx.trigger_request("quick");
	request.ttl_ms = Some(50);
	let run = ctx.engine.trigger(request).await.unwrap();

	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.unwrap();
	ctx.engine
		.start_attempt(run.id, dequeued.snapshot_id, StartAttemptRequest::default())
		.await
		.unwrap();

	tokio::time::sleep(Duration::from_millis(80)).await;
	ctx.tick_timers().await;

	assert_eq!(
		ctx.engine.get_run(run.id).await.unwrap().status,
		RunStatus::Executing
	);
}

// MARK: S5, stalled attempt
#[tokio::test]
async fn stalled_attempt_with_no_budget_crashes() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("doomed")).await.unwrap();
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

	// The stall-check fires with the EXECUTING snapshot still latest: the
	// runner went dark.
	ctx.engine
		.handle_stalled_snapshot(run.id, started.snapshot.id)
		.await
		.unwrap();

	let crashed = ctx.engine.get_run(run.id).await.unwrap();
	assert_eq!(crashed.status, RunStatus::Crashed);
	assert!(ctx.queue.read_message(run.id).await.unwrap().is_none());
}

#[tokio::test]
async fn stalled_attempt_with_budget_left_requeues() {
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

	ctx.engine
		.handle_stalled_snapshot(run.id, started.snapshot.id)
		.await
		.unwrap();

	// Back in the queue for another attempt.
	assert_eq!(
		ctx.engine.get_run(run.id).await.unwrap().status,
		RunStatus::Pending
	);
	let redelivered = ctx
		.engine
		.dequeue_from_master_queue("c2", &ctx.master_queue())
		.await
		.unwrap()
		.expect("stalled run should be redelivered");
	assert_eq!(redelivered.run_id, run.id);
	assert_eq!(redelivered.attempt_count, 1);
}

#[tokio::test]
async fn stale_stall_check_is_dropped() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("healthy")).await.unwrap();
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

	// A timer armed for the dequeue-era snapshot fires late; the run has
	// moved on, so nothing happens.
	ctx.engine
		.handle_stalled_snapshot(run.id, dequeued.snapshot_id)
		.await
		.unwrap();
	assert_eq!(
		ctx.engine.get_run(run.id).await.unwrap().status,
		RunStatus::Executing
	);

	ctx.engine
		.complete_attempt(run.id, started.snapshot.id, AttemptCompletion::success("1"))
		.await
		.unwrap();
}

// MARK: Stalled dequeue
#[tokio::test]
async fn runner_that_never_starts_gets_requeued() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("abandoned")).await.unwrap();
	let dequeued = ctx
		.engine
		.dequeue_from_master_queue("c1", &ctx.master_queue())
		.await
		.unwrap()
		.unwrap();

	// No start_attempt ever arrives; the stall-check fires on the
	// DEQUEUED_FOR_EXECUTION snapshot.
	ctx.engine
		.handle_stalled_snapshot(run.id, dequeued.snapshot_id)
		.await
		.unwrap();

	let snapshot = ctx.engine.db().latest_snapshot(run.id).await.unwrap().unwrap();
	assert_eq!(snapshot.execution_status, ExecutionStatus::Queued);
	assert!(ctx
		.engine
		.dequeue_from_master_queue("c2", &ctx.master_queue())
		.await
		.unwrap()
		.is_some());
}

// MARK: Heartbeats
#[tokio::test]
async fn heartbeat_extends_the_stall_check() {
	let ctx = common::TestCtx::new();

	let run = ctx.engine.trigger(ctx.trigger_request("beating")).await.unwrap();
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

	let beat = ctx.engine.heartbeat(run.id, started.snapshot.id).await.unwrap();
	assert_eq!(beat.id, started.snapshot.id);

	// Heartbeating a stale snapshot is a conflict the runner must react to.
	assert!(ctx.engine.heartbeat(run.id, dequeued.snapshot_id).await.is_err());
}

// MARK: Lost wakeups
#[tokio::test]
async fn resume_scanner_repairs_lost_wakeups() {
	// Zero staleness threshold so the scanner sees the run immediately.
	let ctx = common::TestCtx::with_root(flywheel_config::Root {
		engine: Some(flywheel_config::Engine {
			resume_stale_threshold: Some(0),
			..Default::default()
		}),
		..Default::default()
	});

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

	// Block the run, then simulate the lost wakeup by completing the
	// waitpoint rows without continuing (direct db completion).
	let wait = ctx
		.engine
		.wait_for_duration(
			run.id,
			started.snapshot.id,
			flywheel_util::timestamp::now() + 60_000,
		)
		.await
		.unwrap();
	ctx.engine
		.db()
		.complete_waitpoint(wait.waitpoint_id, None, false, flywheel_util::timestamp::now())
		.await
		.unwrap();

	// Status still says waiting, but no blocking rows exist: the invariant
	// violation the scanner exists to repair.
	assert_eq!(
		ctx.engine.get_run(run.id).await.unwrap().status,
		RunStatus::WaitingToResume
	);
	tokio::time::sleep(Duration::from_millis(5)).await;
	let repaired = ctx.engine.scan_waiting_runs().await.unwrap();
	assert_eq!(repaired, 1);

	assert_eq!(
		ctx.engine.get_run(run.id).await.unwrap().status,
		RunStatus::Executing
	);
}
