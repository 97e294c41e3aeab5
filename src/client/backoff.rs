//! Randomized exponential backoff for token-request retries.

use rand::Rng;
use rand::rngs::StdRng;

/// Delay generator for retrying an unanswered request.
///
/// The first call after construction or [`reset`](Self::reset) returns zero
/// (retry immediately); each later call returns a uniformly random delay in
/// `[0, current_max)` and doubles `current_max`, capped at
/// `initial_max * max_factor`. Randomizing the whole range rather than the
/// tail keeps a recovering fleet from retrying in phase.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_max_ms: u64,
    cap_ms: u64,
    current_max_ms: u64,
    in_retry: bool,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(initial_max_ms: u64, max_factor: u32, rng: StdRng) -> Self {
        let cap_ms = initial_max_ms.saturating_mul(u64::from(max_factor.max(1)));
        Self {
            initial_max_ms,
            cap_ms,
            current_max_ms: initial_max_ms,
            in_retry: false,
            rng,
        }
    }

    pub fn next_delay_ms(&mut self) -> u64 {
        let delay = if self.in_retry {
            let delay = (self.rng.random::<f64>() * self.current_max_ms as f64) as u64;
            if self.current_max_ms <= self.cap_ms {
                self.current_max_ms = self.current_max_ms.saturating_mul(2).min(self.cap_ms);
            }
            delay
        } else {
            0
        };
        self.in_retry = true;
        delay
    }

    pub fn reset(&mut self) {
        self.in_retry = false;
        self.current_max_ms = self.initial_max_ms;
    }
}
