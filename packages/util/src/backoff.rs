use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
pub struct Backoff {
	/// Maximum exponent for the backoff calculation.
	max_exponent: usize,
	/// Maximum amount of retries. `None` retries indefinitely.
	max_retries: Option<usize>,
	/// Base wait time in ms.
	wait: usize,
	/// Maximum randomness in ms added to the wait.
	randomness: usize,
	i: usize,
}

impl Backoff {
	pub fn new(
		max_exponent: usize,
		max_retries: Option<usize>,
		wait: usize,
		randomness: usize,
	) -> Backoff {
		Backoff {
			max_exponent,
			max_retries,
			wait,
			randomness,
			i: 0,
		}
	}

	/// Waits the next backoff interval. Returns false once the retry budget is
	/// exhausted.
	pub async fn tick(&mut self) -> bool {
		if let Some(max_retries) = self.max_retries {
			if self.i >= max_retries {
				return false;
			}
		}

		let exponent = self.i.min(self.max_exponent);
		let randomness = rand::thread_rng().gen_range(0..=self.randomness);
		let delay = self.wait * 2usize.pow(exponent as u32) + randomness;
		tokio::time::sleep(Duration::from_millis(delay as u64)).await;

		self.i += 1;

		true
	}

	pub fn attempt(&self) -> usize {
		self.i
	}
}

impl Default for Backoff {
	fn default() -> Backoff {
		Backoff::new(8, None, 1_000, 1_000)
	}
}
