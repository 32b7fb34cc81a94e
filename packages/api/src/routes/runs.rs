use axum::Json;
use axum::extract::{Path, State};
use flywheel_engine::TriggerRequest;
use flywheel_runner_protocol::RunExecutionData;
use flywheel_types::{ExecutionSnapshot, Run};
use flywheel_util::Id;
use serde::Serialize;

use crate::ApiCtx;
use crate::errors::ApiResult;

#[derive(Serialize)]
pub struct TriggerResponse {
	pub run: Run,
}

#[tracing::instrument(skip_all)]
pub async fn trigger(
	State(ctx): State<ApiCtx>,
	Json(request): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerResponse>> {
	let run = ctx.engine.trigger(request).await?;
	Ok(Json(TriggerResponse { run }))
}

#[tracing::instrument(skip_all, fields(%run_id))]
pub async fn get_run(
	State(ctx): State<ApiCtx>,
	Path(run_id): Path<Id>,
) -> ApiResult<Json<RunExecutionData>> {
	let data = ctx.engine.get_execution_data(run_id).await?;
	Ok(Json(data))
}

#[derive(Serialize)]
pub struct CancelResponse {
	pub snapshot: ExecutionSnapshot,
}

#[tracing::instrument(skip_all, fields(%run_id))]
pub async fn cancel(
	State(ctx): State<ApiCtx>,
	Path(run_id): Path<Id>,
) -> ApiResult<Json<CancelResponse>> {
	let snapshot = ctx.engine.cancel(run_id).await?;
	Ok(Json(CancelResponse { snapshot }))
}
