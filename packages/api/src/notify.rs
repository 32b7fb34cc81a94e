use async_trait::async_trait;
use flywheel_engine::RunNotifier;
use flywheel_runner_protocol::WorkloadServerMessage;
use flywheel_util::Id;
use tokio::sync::mpsc;

/// Fan-out of `run:notify` pushes to workload sockets subscribed to the
/// run's room.
pub struct WorkloadNotifier {
	subscribers: scc::HashMap<Id, Vec<mpsc::UnboundedSender<WorkloadServerMessage>>>,
}

impl WorkloadNotifier {
	pub fn new() -> Self {
		WorkloadNotifier {
			subscribers: scc::HashMap::new(),
		}
	}

	pub async fn subscribe(&self, run_id: Id, tx: mpsc::UnboundedSender<WorkloadServerMessage>) {
		self.subscribers
			.entry_async(run_id)
			.await
			.or_default()
			.push(tx);
	}

	pub async fn unsubscribe(&self, run_id: Id) {
		// Closed senders drop out; the room disappears with its last
		// subscriber.
		self.subscribers
			.update_async(&run_id, |_, senders| {
				senders.retain(|tx| !tx.is_closed());
			})
			.await;
		self.subscribers
			.remove_if_async(&run_id, |senders| senders.is_empty())
			.await;
	}
}

impl Default for WorkloadNotifier {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl RunNotifier for WorkloadNotifier {
	async fn notify(&self, run_id: Id) {
		let mut dead = false;
		if let Some(mut entry) = self.subscribers.get_async(&run_id).await {
			for tx in entry.get().iter() {
				if tx.send(WorkloadServerMessage::Notify { run_id }).is_err() {
					dead = true;
				}
			}
			if dead {
				entry.get_mut().retain(|tx| !tx.is_closed());
			}
		}
	}
}
