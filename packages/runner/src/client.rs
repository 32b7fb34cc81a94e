use anyhow::{Context, Result};
use flywheel_runner_protocol::{
	CompleteAttemptRequest, CompleteAttemptResponse, DequeuedMessage, RunExecutionData,
	StartAttemptRequest, StartAttemptResponse, SuspendResponse, WaitForDurationRequest,
	WaitForDurationResponse,
};
use flywheel_types::{AttemptCompletion, ExecutionSnapshot};
use flywheel_util::Id;
use reqwest::StatusCode;

use crate::config::RunnerConfig;

const MASTER_QUEUE_HEADER: &str = "x-flywheel-master-queue";
const RUNNER_ID_HEADER: &str = "x-flywheel-runner-id";

/// Protocol-level failures the runner branches on.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// 409: the snapshot we hold is stale. Fatal for the current attempt.
	#[error("snapshot conflict")]
	Conflict,
	#[error("run not found")]
	NotFound,
	#[error("unexpected status {0}")]
	Status(StatusCode),
}

/// Thin typed wrapper over the platform's runner-scoped HTTP surface.
#[derive(Clone)]
pub struct PlatformClient {
	http: reqwest::Client,
	config: RunnerConfig,
}

impl PlatformClient {
	pub fn new(config: RunnerConfig) -> Result<Self> {
		Ok(PlatformClient {
			http: reqwest::Client::builder()
				.build()
				.context("failed building http client")?,
			config,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match &self.config.runner_token {
			Some(token) => req.bearer_auth(token),
			None => req,
		}
	}

	async fn check<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
		match response.status() {
			status if status.is_success() => {
				response.json::<T>().await.context("invalid response body")
			}
			StatusCode::CONFLICT => Err(ClientError::Conflict.into()),
			StatusCode::NOT_FOUND => Err(ClientError::NotFound.into()),
			status => Err(ClientError::Status(status).into()),
		}
	}

	/// One long-poll pass. `None` means the window closed without work.
	pub async fn warm_start(&self) -> Result<Option<DequeuedMessage>> {
		let response = self
			.authed(self.http.get(self.url("/warm-start")))
			.header(MASTER_QUEUE_HEADER, &self.config.master_queue)
			.header(RUNNER_ID_HEADER, &self.config.runner_id)
			.send()
			.await
			.context("warm-start request failed")?;

		if response.status() == StatusCode::NO_CONTENT {
			return Ok(None);
		}
		Ok(Some(Self::check(response).await?))
	}

	pub async fn start_attempt(
		&self,
		run_id: Id,
		snapshot_id: Id,
		request: StartAttemptRequest,
	) -> Result<StartAttemptResponse> {
		let response = self
			.authed(self.http.post(self.url(&format!(
				"/runs/{run_id}/snapshots/{snapshot_id}/attempts/start"
			))))
			.json(&request)
			.send()
			.await
			.context("start-attempt request failed")?;
		Self::check(response).await
	}

	pub async fn heartbeat(&self, run_id: Id, snapshot_id: Id) -> Result<ExecutionSnapshot> {
		let response = self
			.authed(
				self.http
					.post(self.url(&format!("/runs/{run_id}/snapshots/{snapshot_id}/heartbeat"))),
			)
			.send()
			.await
			.context("heartbeat request failed")?;
		Self::check(response).await
	}

	pub async fn complete(
		&self,
		run_id: Id,
		snapshot_id: Id,
		completion: AttemptCompletion,
	) -> Result<CompleteAttemptResponse> {
		let response = self
			.authed(
				self.http
					.post(self.url(&format!("/runs/{run_id}/snapshots/{snapshot_id}/complete"))),
			)
			.json(&CompleteAttemptRequest { completion })
			.send()
			.await
			.context("complete request failed")?;
		Self::check(response).await
	}

	pub async fn suspend(&self, run_id: Id, snapshot_id: Id) -> Result<SuspendResponse> {
		let response = self
			.authed(
				self.http
					.post(self.url(&format!("/runs/{run_id}/snapshots/{snapshot_id}/suspend"))),
			)
			.send()
			.await
			.context("suspend request failed")?;
		Self::check(response).await
	}

	pub async fn continue_execution(
		&self,
		run_id: Id,
		snapshot_id: Id,
	) -> Result<RunExecutionData> {
		let response = self
			.authed(
				self.http
					.post(self.url(&format!("/runs/{run_id}/snapshots/{snapshot_id}/continue"))),
			)
			.send()
			.await
			.context("continue request failed")?;
		Self::check(response).await
	}

	pub async fn wait_duration(
		&self,
		run_id: Id,
		snapshot_id: Id,
		date: i64,
	) -> Result<WaitForDurationResponse> {
		let response = self
			.authed(self.http.post(self.url(&format!(
				"/runs/{run_id}/snapshots/{snapshot_id}/wait/duration"
			))))
			.json(&WaitForDurationRequest { date })
			.send()
			.await
			.context("wait-duration request failed")?;
		Self::check(response).await
	}

	/// Snapshot-poll fallback.
	pub async fn execution_data(&self, run_id: Id) -> Result<RunExecutionData> {
		let response = self
			.authed(self.http.get(self.url(&format!("/runs/{run_id}/execution"))))
			.send()
			.await
			.context("execution-data request failed")?;
		Self::check(response).await
	}

	pub fn config(&self) -> &RunnerConfig {
		&self.config
	}

	/// ws(s) url for the workload socket.
	pub fn workload_url(&self) -> String {
		let base = self
			.config
			.endpoint
			.trim_end_matches('/')
			.replacen("http", "ws", 1);
		format!("{base}/workload")
	}
}
