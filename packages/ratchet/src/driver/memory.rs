use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::driver::TimerDriver;
use crate::job::TimerJob;

/// In-process timer store for tests and local development.
#[derive(Default)]
pub struct MemoryTimerDriver {
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	/// (available_at, id), ordered.
	timeline: BTreeSet<(i64, String)>,
	bodies: HashMap<String, Body>,
}

struct Body {
	kind: String,
	payload: serde_json::Value,
	attempts: u32,
}

impl MemoryTimerDriver {
	pub fn new() -> Self {
		Self::default()
	}
}

impl State {
	fn reschedule(&mut self, job_id: &str, available_at: i64) {
		self.timeline.retain(|(_, id)| id != job_id);
		self.timeline.insert((available_at, job_id.to_string()));
	}
}

#[async_trait]
impl TimerDriver for MemoryTimerDriver {
	async fn enqueue(&self, job: &TimerJob) -> Result<()> {
		let mut state = self.state.lock().unwrap();

		state.reschedule(&job.id, job.available_at);
		state.bodies.insert(
			job.id.clone(),
			Body {
				kind: job.kind.clone(),
				payload: job.payload.clone(),
				attempts: 0,
			},
		);

		Ok(())
	}

	async fn pull(
		&self,
		now: i64,
		visibility_timeout_ms: i64,
		limit: usize,
	) -> Result<Vec<TimerJob>> {
		let mut state = self.state.lock().unwrap();

		let due = state
			.timeline
			.iter()
			.take_while(|(available_at, _)| *available_at <= now)
			.take(limit)
			.cloned()
			.collect::<Vec<_>>();

		let mut jobs = Vec::with_capacity(due.len());
		for (available_at, id) in due {
			state.timeline.remove(&(available_at, id.clone()));

			let Some(body) = state.bodies.get_mut(&id) else {
				continue;
			};
			body.attempts += 1;
			jobs.push(TimerJob {
				id: id.clone(),
				kind: body.kind.clone(),
				payload: body.payload.clone(),
				available_at,
				attempts: body.attempts,
			});

			// Invisible until the visibility timeout elapses.
			state
				.timeline
				.insert((now + visibility_timeout_ms, id));
		}

		Ok(jobs)
	}

	async fn ack(&self, job_id: &str) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		state.timeline.retain(|(_, id)| id != job_id);
		state.bodies.remove(job_id);
		Ok(())
	}

	async fn nack(&self, job_id: &str, retry_at: i64) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		if state.bodies.contains_key(job_id) {
			state.reschedule(job_id, retry_at);
		}
		Ok(())
	}

	async fn cancel(&self, job_id: &str) -> Result<()> {
		self.ack(job_id).await
	}

	async fn len(&self) -> Result<u64> {
		let state = self.state.lock().unwrap();
		Ok(state.bodies.len() as u64)
	}
}
