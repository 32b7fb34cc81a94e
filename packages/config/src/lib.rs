use std::{ops::Deref, path::Path, sync::Arc};

use anyhow::{Context, Result};

pub mod config;

pub use config::*;

/// Cheaply cloneable handle to the loaded config tree.
#[derive(Clone, Debug)]
pub struct Config(Arc<Root>);

impl Config {
	pub fn from_root(root: Root) -> Self {
		Config(Arc::new(root))
	}

	/// Loads and deep-merges config files in order. Later files win per key.
	pub async fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
		if paths.is_empty() {
			return Ok(Config::from_root(Root::default()));
		}

		let mut merged = serde_json::Value::Object(Default::default());
		for path in paths {
			let path = path.as_ref();
			let raw = tokio::fs::read_to_string(path)
				.await
				.with_context(|| format!("failed reading config file {}", path.display()))?;
			let value = serde_json::from_str::<serde_json::Value>(&raw)
				.with_context(|| format!("failed parsing config file {}", path.display()))?;
			merge(&mut merged, value);
		}

		let root = serde_json::from_value::<Root>(merged).context("invalid config")?;
		Ok(Config::from_root(root))
	}
}

impl Deref for Config {
	type Target = Root;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

fn merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
	match (base, overlay) {
		(serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
			for (k, v) in overlay {
				merge(base.entry(k).or_insert(serde_json::Value::Null), v);
			}
		}
		(base, overlay) => *base = overlay,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_resolve() {
		let config = Config::from_root(Root::default());
		assert_eq!(config.queue().env_candidate_sample_size(), 12);
		assert_eq!(config.queue().queue_candidate_sample_size(), 36);
		assert_eq!(config.engine().lock_lease_ms(), 5_000);
	}

	#[test]
	fn merge_overlays_nested_keys() {
		let mut base = serde_json::json!({"queue": {"prefix": "a:", "envCandidateSampleSize": 4}});
		merge(
			&mut base,
			serde_json::json!({"queue": {"prefix": "b:"}}),
		);
		assert_eq!(base["queue"]["prefix"], "b:");
		assert_eq!(base["queue"]["envCandidateSampleSize"], 4);
	}
}
