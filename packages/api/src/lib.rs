use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use flywheel_engine::Engine;

pub mod auth;
pub mod errors;
pub mod notify;
pub mod routes;

pub use notify::WorkloadNotifier;

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiCtx {
	pub engine: Engine,
	pub config: flywheel_config::Config,
	pub notifier: Arc<WorkloadNotifier>,
}

/// Builds the public + runner-scoped router and installs the workload
/// notifier on the engine.
#[tracing::instrument(skip_all)]
pub async fn router(config: flywheel_config::Config, engine: Engine) -> Result<Router> {
	let notifier = Arc::new(WorkloadNotifier::new());
	engine.set_notifier(notifier.clone());

	let ctx = ApiCtx {
		engine,
		config,
		notifier,
	};

	let public = Router::new()
		.route("/trigger", post(routes::runs::trigger))
		.route("/runs/{run_id}", get(routes::runs::get_run))
		.route("/runs/{run_id}/cancel", post(routes::runs::cancel))
		.layer(axum::middleware::from_fn_with_state(
			ctx.clone(),
			auth::public_auth,
		));

	let runner = Router::new()
		.route("/warm-start", get(routes::runner::warm_start))
		.route(
			"/runs/{run_id}/snapshots/{snapshot_id}/attempts/start",
			post(routes::runner::start_attempt),
		)
		.route(
			"/runs/{run_id}/snapshots/{snapshot_id}/heartbeat",
			post(routes::runner::heartbeat),
		)
		.route(
			"/runs/{run_id}/snapshots/{snapshot_id}/complete",
			post(routes::runner::complete),
		)
		.route(
			"/runs/{run_id}/snapshots/{snapshot_id}/suspend",
			post(routes::runner::suspend),
		)
		.route(
			"/runs/{run_id}/snapshots/{snapshot_id}/continue",
			post(routes::runner::continue_execution),
		)
		.route(
			"/runs/{run_id}/snapshots/{snapshot_id}/wait/duration",
			post(routes::runner::wait_duration),
		)
		.route("/runs/{run_id}/execution", get(routes::runner::execution_data))
		.route("/workload", get(routes::workload::workload_socket))
		.layer(axum::middleware::from_fn_with_state(
			ctx.clone(),
			auth::runner_auth,
		));

	Ok(Router::new()
		.merge(public)
		.merge(runner)
		.route("/health", get(routes::health))
		.layer(tower_http::trace::TraceLayer::new_for_http())
		.with_state(ctx))
}
