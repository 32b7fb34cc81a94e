use std::collections::HashMap;

use rand::Rng;

/// Weighted-random selection that biases away from recently-chosen
/// candidates. This is the only mechanism preventing head-of-line blocking
/// across tenants, so every candidate must always keep a non-zero weight.
pub struct FairPriorityStrategy {
	/// Maximum candidates considered per pass.
	max_candidates: usize,
	/// How often recent-selection counts decay.
	decay_interval_ms: i64,
	counts: HashMap<String, u32>,
	last_decay: i64,
}

impl FairPriorityStrategy {
	pub fn new(max_candidates: usize, decay_interval_ms: i64) -> Self {
		FairPriorityStrategy {
			max_candidates,
			decay_interval_ms,
			counts: HashMap::new(),
			last_decay: flywheel_util::timestamp::now(),
		}
	}

	/// Picks one candidate, weighted inversely to how often each was picked
	/// recently. Empty input returns `None`.
	pub fn choose(&mut self, candidates: &[String]) -> Option<String> {
		self.maybe_decay();

		let candidates = &candidates[..candidates.len().min(self.max_candidates)];
		if candidates.is_empty() {
			return None;
		}

		let weights = candidates
			.iter()
			.map(|c| 1.0 / (1.0 + self.counts.get(c).copied().unwrap_or(0) as f64))
			.collect::<Vec<_>>();
		let total = weights.iter().sum::<f64>();

		let mut roll = rand::thread_rng().gen_range(0.0..total);
		let mut chosen = candidates.len() - 1;
		for (i, weight) in weights.iter().enumerate() {
			if roll < *weight {
				chosen = i;
				break;
			}
			roll -= weight;
		}

		let choice = candidates[chosen].clone();
		*self.counts.entry(choice.clone()).or_insert(0) += 1;

		Some(choice)
	}

	/// Halves all recent-selection counts once per decay interval so weights
	/// recover instead of pinning a busy tenant at the floor forever.
	fn maybe_decay(&mut self) {
		let now = flywheel_util::timestamp::now();
		if now - self.last_decay < self.decay_interval_ms {
			return;
		}
		self.last_decay = now;

		self.counts.retain(|_, count| {
			*count /= 2;
			*count > 0
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_candidates_returns_none() {
		let mut strategy = FairPriorityStrategy::new(36, 30_000);
		assert_eq!(strategy.choose(&[]), None);
	}

	#[test]
	fn single_candidate_always_chosen() {
		let mut strategy = FairPriorityStrategy::new(36, 30_000);
		let candidates = vec!["a".to_string()];
		for _ in 0..100 {
			assert_eq!(strategy.choose(&candidates), Some("a".to_string()));
		}
	}

	#[test]
	fn no_candidate_starves() {
		let mut strategy = FairPriorityStrategy::new(36, i64::MAX / 2);
		let candidates = (0..8).map(|i| format!("env-{i}")).collect::<Vec<_>>();

		let mut hits = HashMap::<String, u32>::new();
		for _ in 0..4_000 {
			let choice = strategy.choose(&candidates).unwrap();
			*hits.entry(choice).or_insert(0) += 1;
		}

		// Inverse-recency weighting drives long-run rates toward 1/N each.
		for candidate in &candidates {
			let share = *hits.get(candidate).unwrap_or(&0) as f64 / 4_000.0;
			assert!(
				share > 0.06 && share < 0.20,
				"candidate {candidate} share {share} outside fairness bounds"
			);
		}
	}

	#[test]
	fn respects_max_candidates() {
		let mut strategy = FairPriorityStrategy::new(2, 30_000);
		let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
		for _ in 0..200 {
			let choice = strategy.choose(&candidates).unwrap();
			assert_ne!(choice, "c");
		}
	}
}
