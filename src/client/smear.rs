//! Delay smearing to desynchronize client fleets.

use rand::Rng;
use rand::rngs::StdRng;

/// Randomizes delays by a uniform factor in `[-fraction, +fraction]` so
/// fleets of clients running the same schedule do not fire in lockstep.
///
/// For delay `d` the result lies in `[ceil(d*(1-f)), ceil(d*(1+f))]`;
/// `smear(0)` is always `0`. The RNG is injected so schedules are
/// reproducible under a fixed seed.
#[derive(Debug)]
pub struct Smearer {
    fraction: f64,
    rng: StdRng,
}

impl Smearer {
    /// `fraction` must already be validated to lie in (0, 1].
    pub fn new(fraction: f64, rng: StdRng) -> Self {
        debug_assert!(fraction > 0.0 && fraction <= 1.0);
        Self { fraction, rng }
    }

    pub fn smear(&mut self, delay_ms: u64) -> u64 {
        if delay_ms == 0 {
            return 0;
        }
        let u: f64 = self.rng.random_range(-1.0..=1.0);
        let smeared = delay_ms as f64 * (1.0 + u * self.fraction);
        smeared.ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn zero_stays_zero() {
        let mut smearer = Smearer::new(0.2, StdRng::seed_from_u64(7));
        assert_eq!(smearer.smear(0), 0);
    }

    #[test]
    fn stays_within_fraction_bounds() {
        let mut smearer = Smearer::new(0.2, StdRng::seed_from_u64(42));
        for delay in [1u64, 13, 500, 1_200_000] {
            for _ in 0..200 {
                let smeared = smearer.smear(delay);
                let lo = (delay as f64 * 0.8).ceil() as u64;
                let hi = (delay as f64 * 1.2).ceil() as u64;
                assert!(
                    (lo..=hi).contains(&smeared),
                    "smear({delay}) = {smeared} outside [{lo}, {hi}]"
                );
            }
        }
    }

    #[test]
    fn same_seed_same_schedule() {
        let mut a = Smearer::new(0.5, StdRng::seed_from_u64(9));
        let mut b = Smearer::new(0.5, StdRng::seed_from_u64(9));
        let draws_a: Vec<u64> = (0..32).map(|_| a.smear(10_000)).collect();
        let draws_b: Vec<u64> = (0..32).map(|_| b.smear(10_000)).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn spreads_across_the_range() {
        let mut smearer = Smearer::new(1.0, StdRng::seed_from_u64(1));
        let draws: std::collections::BTreeSet<u64> =
            (0..256).map(|_| smearer.smear(1_000)).collect();
        assert!(draws.len() > 100, "only {} distinct draws", draws.len());
    }
}
