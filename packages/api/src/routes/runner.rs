use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use flywheel_runner_protocol::{
	CompleteAttemptRequest, CompleteAttemptResponse, DequeuedMessage, RunExecutionData,
	StartAttemptRequest, StartAttemptResponse, SuspendResponse, WaitForDurationRequest,
	WaitForDurationResponse,
};
use flywheel_types::ExecutionSnapshot;
use flywheel_util::Id;

use crate::ApiCtx;
use crate::errors::ApiResult;

const MASTER_QUEUE_HEADER: &str = "x-flywheel-master-queue";
const RUNNER_ID_HEADER: &str = "x-flywheel-runner-id";

/// Long-poll dequeue. Holds the connection until a message arrives or the
/// poll window closes with a 204.
#[tracing::instrument(skip_all)]
pub async fn warm_start(State(ctx): State<ApiCtx>, headers: HeaderMap) -> ApiResult<Response> {
	let master_queue = headers
		.get(MASTER_QUEUE_HEADER)
		.and_then(|value| value.to_str().ok())
		.unwrap_or(conveyor::keys::SHARED_QUEUE)
		.to_string();
	let consumer_id = headers
		.get(RUNNER_ID_HEADER)
		.and_then(|value| value.to_str().ok())
		.unwrap_or("anonymous")
		.to_string();

	let api_config = ctx.config.api();
	let deadline =
		Instant::now() + Duration::from_millis(api_config.warm_start_max_wait_ms() as u64);
	let poll_interval = Duration::from_millis(api_config.warm_start_poll_interval_ms() as u64);

	loop {
		if let Some(message) = ctx
			.engine
			.dequeue_from_master_queue(&consumer_id, &master_queue)
			.await?
		{
			return Ok(Json::<DequeuedMessage>(message).into_response());
		}
		if Instant::now() >= deadline {
			return Ok(StatusCode::NO_CONTENT.into_response());
		}
		tokio::time::sleep(poll_interval).await;
	}
}

#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
pub async fn start_attempt(
	State(ctx): State<ApiCtx>,
	Path((run_id, snapshot_id)): Path<(Id, Id)>,
	Json(request): Json<StartAttemptRequest>,
) -> ApiResult<Json<StartAttemptResponse>> {
	let response = ctx.engine.start_attempt(run_id, snapshot_id, request).await?;
	Ok(Json(response))
}

#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
pub async fn heartbeat(
	State(ctx): State<ApiCtx>,
	Path((run_id, snapshot_id)): Path<(Id, Id)>,
) -> ApiResult<Json<ExecutionSnapshot>> {
	let snapshot = ctx.engine.heartbeat(run_id, snapshot_id).await?;
	Ok(Json(snapshot))
}

#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
pub async fn complete(
	State(ctx): State<ApiCtx>,
	Path((run_id, snapshot_id)): Path<(Id, Id)>,
	Json(request): Json<CompleteAttemptRequest>,
) -> ApiResult<Json<CompleteAttemptResponse>> {
	let response = ctx
		.engine
		.complete_attempt(run_id, snapshot_id, request.completion)
		.await?;
	Ok(Json(response))
}

#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
pub async fn suspend(
	State(ctx): State<ApiCtx>,
	Path((run_id, snapshot_id)): Path<(Id, Id)>,
) -> ApiResult<Json<SuspendResponse>> {
	let response = ctx.engine.suspend_run(run_id, snapshot_id).await?;
	Ok(Json(response))
}

#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
pub async fn continue_execution(
	State(ctx): State<ApiCtx>,
	Path((run_id, snapshot_id)): Path<(Id, Id)>,
) -> ApiResult<Json<RunExecutionData>> {
	let data = ctx.engine.continue_run_execution(run_id, snapshot_id).await?;
	Ok(Json(data))
}

#[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
pub async fn wait_duration(
	State(ctx): State<ApiCtx>,
	Path((run_id, snapshot_id)): Path<(Id, Id)>,
	Json(request): Json<WaitForDurationRequest>,
) -> ApiResult<Json<WaitForDurationResponse>> {
	let response = ctx
		.engine
		.wait_for_duration(run_id, snapshot_id, request.date)
		.await?;
	Ok(Json(response))
}

/// Snapshot-poll fallback for runners that miss a notify.
#[tracing::instrument(skip_all, fields(%run_id))]
pub async fn execution_data(
	State(ctx): State<ApiCtx>,
	Path(run_id): Path<Id>,
) -> ApiResult<Json<RunExecutionData>> {
	let data = ctx.engine.get_execution_data(run_id).await?;
	Ok(Json(data))
}
