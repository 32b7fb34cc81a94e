use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier for runs, snapshots, waitpoints, and attempts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(Uuid);

impl Id {
	pub fn new() -> Self {
		Id(Uuid::new_v4())
	}

	pub const fn nil() -> Self {
		Id(Uuid::nil())
	}

	pub fn as_uuid(&self) -> Uuid {
		self.0
	}
}

impl Default for Id {
	fn default() -> Self {
		Id::new()
	}
}

impl fmt::Display for Id {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.hyphenated())
	}
}

impl fmt::Debug for Id {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.hyphenated())
	}
}

impl FromStr for Id {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Id(Uuid::parse_str(s)?))
	}
}

impl From<Uuid> for Id {
	fn from(uuid: Uuid) -> Self {
		Id(uuid)
	}
}

/// User-facing id with a type prefix, e.g. `run_0f8b3c…`.
pub fn friendly_id(prefix: &str, id: Id) -> String {
	format!("{}_{}", prefix, id.0.simple())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_through_str() {
		let id = Id::new();
		let parsed = id.to_string().parse::<Id>().unwrap();
		assert_eq!(id, parsed);
	}

	#[test]
	fn friendly_ids_carry_prefix() {
		let id = Id::new();
		let friendly = friendly_id("run", id);
		assert!(friendly.starts_with("run_"));
		assert_eq!(friendly.len(), "run_".len() + 32);
	}
}
