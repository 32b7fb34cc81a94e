use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Redis {
	pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Postgres {
	pub url: String,
	pub max_connections: Option<u32>,
}

impl Postgres {
	pub fn max_connections(&self) -> u32 {
		self.max_connections.unwrap_or(16)
	}
}
