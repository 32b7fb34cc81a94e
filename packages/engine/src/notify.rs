use async_trait::async_trait;
use flywheel_util::Id;

/// Pushes "snapshot changed" hints to connected runners. The API layer
/// provides the real implementation backed by the `/workload` socket; the
/// engine only ever fires-and-forgets.
#[async_trait]
pub trait RunNotifier: Send + Sync {
	async fn notify(&self, run_id: Id);
}

/// Used until a transport registers itself; runners still observe changes
/// via the snapshot poll.
pub struct NoopNotifier;

#[async_trait]
impl RunNotifier for NoopNotifier {
	async fn notify(&self, _run_id: Id) {}
}
