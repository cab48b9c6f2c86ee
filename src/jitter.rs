//! Randomised TTL extension.
//!
//! Calendar counters created within the same period share one boundary instant. Extending each
//! TTL by a random amount keeps the store from expiring them all in the same tick.

use rand::Rng;
use std::time::Duration;

/// How much of a spread gets added to a TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Exact TTLs.
    None,
    /// Anywhere in `[0, spread]`.
    #[default]
    Full,
    /// At least half the spread.
    Equal,
}

impl Jitter {
    pub fn apply(&self, spread: Duration) -> Duration {
        self.apply_with_rng(spread, &mut rand::rng())
    }

    /// Same as [`Jitter::apply`] with the randomness supplied by the caller.
    pub fn apply_with_rng<R: Rng + ?Sized>(&self, spread: Duration, rng: &mut R) -> Duration {
        let ceiling = as_millis_saturated(spread);
        let floor = match self {
            Jitter::None => return Duration::ZERO,
            Jitter::Full => 0,
            Jitter::Equal => ceiling / 2,
        };
        if ceiling == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(floor..=ceiling))
        }
    }

    /// `base` plus at most `spread`, saturating.
    pub fn extend(&self, base: Duration, spread: Duration) -> Duration {
        base.saturating_add(self.apply(spread))
    }
}

pub(crate) fn as_millis_saturated(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SPREAD: Duration = Duration::from_secs(2);

    #[test]
    fn exact_ttl_ignores_spread() {
        let ttl = Duration::from_secs(30);
        assert_eq!(Jitter::None.extend(ttl, SPREAD), ttl);
    }

    #[test]
    fn extension_never_exceeds_spread() {
        let mut rng = StdRng::seed_from_u64(7);
        let ttl = Duration::from_secs(30);
        for strategy in [Jitter::Full, Jitter::Equal] {
            let drawn = (0..64).map(|_| strategy.apply_with_rng(SPREAD, &mut rng));
            assert!(drawn.into_iter().all(|d| d <= SPREAD));
            assert!(strategy.extend(ttl, SPREAD) <= ttl + SPREAD);
        }
    }

    #[test]
    fn equal_never_draws_below_half() {
        let mut rng = StdRng::seed_from_u64(2026);
        let lowest = (0..64)
            .map(|_| Jitter::Equal.apply_with_rng(SPREAD, &mut rng))
            .min()
            .unwrap_or_default();
        assert!(lowest >= SPREAD / 2, "drew {lowest:?}");
    }

    #[test]
    fn empty_spread_draws_nothing() {
        for strategy in [Jitter::None, Jitter::Full, Jitter::Equal] {
            assert_eq!(strategy.apply(Duration::ZERO), Duration::ZERO);
        }
    }

    #[test]
    fn oversized_durations_saturate() {
        assert_eq!(as_millis_saturated(Duration::MAX), u64::MAX);
        assert_eq!(Jitter::Equal.extend(Duration::MAX, SPREAD), Duration::MAX);
    }
}
