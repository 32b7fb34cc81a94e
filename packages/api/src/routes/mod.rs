use axum::Json;

pub mod runner;
pub mod runs;
pub mod workload;

pub async fn health() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "ok": true }))
}
