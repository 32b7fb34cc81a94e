use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

/// A durable timer entry. Deterministic ids collapse duplicate scheduling:
/// enqueueing an id that already exists replaces its timer and payload.
#[derive(Debug, Clone)]
pub struct TimerJob {
	pub id: String,
	pub kind: String,
	pub payload: serde_json::Value,
	pub available_at: i64,
	/// Delivery attempts so far, incremented on pull.
	pub attempts: u32,
}

impl TimerJob {
	pub fn new(
		id: impl Into<String>,
		kind: impl Into<String>,
		payload: serde_json::Value,
		available_at: i64,
	) -> Self {
		TimerJob {
			id: id.into(),
			kind: kind.into(),
			payload,
			available_at,
			attempts: 0,
		}
	}
}

#[async_trait]
pub trait JobHandler: Send + Sync {
	fn kind(&self) -> &'static str;

	async fn handle(&self, payload: serde_json::Value) -> Result<()>;
}

pub type RegistryHandle = Arc<Registry>;

/// Maps job kinds to their handlers.
#[derive(Default)]
pub struct Registry {
	handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<()> {
		let kind = handler.kind();
		if self.handlers.insert(kind, handler).is_some() {
			bail!("duplicate job handler registered for kind {kind:?}");
		}
		Ok(())
	}

	pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
		self.handlers.get(kind).cloned()
	}

	pub fn size(&self) -> usize {
		self.handlers.len()
	}
}
