use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;

use crate::ApiCtx;

/// Bearer check for the public routes. An unset token disables auth (local
/// development only).
pub async fn public_auth(
	State(ctx): State<ApiCtx>,
	req: Request<Body>,
	next: Next,
) -> Result<Response, StatusCode> {
	check_bearer(&req, ctx.config.api().auth_token.as_deref())?;
	Ok(next.run(req).await)
}

/// Bearer check for the runner-scoped routes.
pub async fn runner_auth(
	State(ctx): State<ApiCtx>,
	req: Request<Body>,
	next: Next,
) -> Result<Response, StatusCode> {
	check_bearer(&req, ctx.config.api().runner_token.as_deref())?;
	Ok(next.run(req).await)
}

fn check_bearer(req: &Request<Body>, expected: Option<&str>) -> Result<(), StatusCode> {
	let Some(expected) = expected else {
		return Ok(());
	};

	let provided = req
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "));

	match provided {
		Some(token) if token == expected => Ok(()),
		_ => Err(StatusCode::UNAUTHORIZED),
	}
}
