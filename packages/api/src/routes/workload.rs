use std::collections::HashSet;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use flywheel_runner_protocol::{WorkloadClientMessage, WorkloadServerMessage};
use flywheel_util::Id;
use tokio::sync::mpsc;

use crate::ApiCtx;

/// `/workload`: runners subscribe to `run:{run_id}` rooms and receive
/// `run:notify` pushes when a snapshot changes externally.
#[tracing::instrument(skip_all)]
pub async fn workload_socket(State(ctx): State<ApiCtx>, ws: WebSocketUpgrade) -> Response {
	ws.on_upgrade(move |socket| handle_socket(ctx, socket))
}

async fn handle_socket(ctx: ApiCtx, mut socket: WebSocket) {
	let (tx, mut rx) = mpsc::unbounded_channel::<WorkloadServerMessage>();
	let mut subscribed = HashSet::<Id>::new();

	loop {
		tokio::select! {
			message = socket.recv() => {
				let Some(Ok(message)) = message else {
					break;
				};
				let Message::Text(text) = message else {
					continue;
				};

				match serde_json::from_str::<WorkloadClientMessage>(&text) {
					Ok(WorkloadClientMessage::Subscribe { run_id }) => {
						if subscribed.insert(run_id) {
							ctx.notifier.subscribe(run_id, tx.clone()).await;
						}
					}
					Ok(WorkloadClientMessage::Unsubscribe { run_id }) => {
						subscribed.remove(&run_id);
						ctx.notifier.unsubscribe(run_id).await;
					}
					Err(err) => {
						tracing::debug!(?err, "malformed workload message");
					}
				}
			}
			notification = rx.recv() => {
				let Some(notification) = notification else {
					break;
				};
				let Ok(payload) = serde_json::to_string(&notification) else {
					continue;
				};
				if socket.send(Message::Text(payload.into())).await.is_err() {
					break;
				}
			}
		}
	}

	// Dropping `tx` closes our senders; sweep the rooms we were in.
	drop(tx);
	for run_id in subscribed {
		ctx.notifier.unsubscribe(run_id).await;
	}

	tracing::debug!("workload socket closed");
}
