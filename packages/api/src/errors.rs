use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flywheel_types::EngineError;

/// Wraps engine failures so handlers can use `?`. Typed engine errors map to
/// meaningful statuses; everything else is a 500.
pub struct ApiError(pub anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
	fn from(err: E) -> Self {
		ApiError(err.into())
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, code) = match self.0.downcast_ref::<EngineError>() {
			Some(EngineError::RunNotFound(_)) | Some(EngineError::WaitpointNotFound(_)) => {
				(StatusCode::NOT_FOUND, "not_found")
			}
			Some(EngineError::SnapshotMismatch { .. }) => (StatusCode::CONFLICT, "snapshot_stale"),
			Some(EngineError::NoSnapshot(_)) => {
				(StatusCode::INTERNAL_SERVER_ERROR, "no_snapshot")
			}
			Some(EngineError::LockTimeout(_)) => (StatusCode::CONFLICT, "lock_timeout"),
			Some(EngineError::InvalidState { .. }) => (StatusCode::CONFLICT, "invalid_state"),
			Some(EngineError::OutOfEntitlement) => {
				(StatusCode::PAYMENT_REQUIRED, "out_of_entitlement")
			}
			Some(EngineError::Validation(_)) => (StatusCode::BAD_REQUEST, "validation"),
			Some(EngineError::Internal { .. }) | None => {
				(StatusCode::INTERNAL_SERVER_ERROR, "internal")
			}
		};

		if status.is_server_error() {
			tracing::error!(err=?self.0, "api request failed");
		} else {
			tracing::debug!(err=?self.0, %status, "api request rejected");
		}

		(
			status,
			Json(serde_json::json!({
				"error": {
					"code": code,
					"message": self.0.to_string(),
				}
			})),
		)
			.into_response()
	}
}

pub type ApiResult<T> = Result<T, ApiError>;
