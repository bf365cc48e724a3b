//! Delay between a division's new-bounty spawns.

use crate::config::NewBountyDelay;
use crate::error::{BountyError, Result};
use crate::scheduler::{DelayGenerator, delay_generator};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Temperature exponent of the temperature-scaled delay.
const TEMPERATURE_EXPONENT: f64 = -0.1;

impl NewBountyDelay {
    /// Delay until the next spawn attempt.
    ///
    /// `latest_route_len` is the route length of the division's most recent
    /// bounty, or `None` before its first spawn. A non-positive temperature
    /// is treated as 1.
    ///
    /// # Errors
    ///
    /// [`BountyError::Config`] for an empty random range or a non-finite result.
    pub fn delay<R: Rng + ?Sized>(
        &self,
        latest_route_len: Option<usize>,
        temperature: f64,
        rng: &mut R,
    ) -> Result<Duration> {
        let secs = match self {
            Self::Fixed { secs } => *secs as f64,
            Self::Random { min_secs, max_secs } => uniform(*min_secs, *max_secs, rng)?,
            Self::FixedRouteScale {
                secs,
                coefficient,
                fallback_route_len,
            } => *secs as f64 * route_scale(latest_route_len, *fallback_route_len, *coefficient),
            Self::RandomRouteScale {
                min_secs,
                max_secs,
                coefficient,
                fallback_route_len,
            } => {
                uniform(*min_secs, *max_secs, rng)?
                    * route_scale(latest_route_len, *fallback_route_len, *coefficient)
            }
            Self::RandomRouteScaleTempScale {
                min_secs,
                max_secs,
                coefficient,
                fallback_route_len,
            } => {
                let temperature = if temperature > 0.0 { temperature } else { 1.0 };
                uniform(*min_secs, *max_secs, rng)?
                    * route_scale(latest_route_len, *fallback_route_len, *coefficient)
                    * temperature.powf(TEMPERATURE_EXPONENT)
            }
        };

        Duration::try_from_secs_f64(secs)
            .map_err(|e| BountyError::Config(format!("spawn delay of {secs}s: {e}")))
    }
}

fn uniform<R: Rng + ?Sized>(min_secs: u64, max_secs: u64, rng: &mut R) -> Result<f64> {
    if min_secs > max_secs {
        return Err(BountyError::Config(format!(
            "spawn delay range {min_secs}..={max_secs} is empty"
        )));
    }
    Ok(rng.gen_range(min_secs..=max_secs) as f64)
}

fn route_scale(latest_route_len: Option<usize>, fallback: usize, coefficient: f64) -> f64 {
    latest_route_len.unwrap_or(fallback) as f64 * coefficient
}

/// Inputs to a division's spawn delay, shared with its spawner task.
#[derive(Debug, Clone)]
pub struct SpawnCadence {
    pub policy: NewBountyDelay,
    pub latest_route_len: Option<usize>,
    pub temperature: f64,
}

/// Cadence shared between a division and its spawner's delay generator.
pub type SharedCadence = Arc<Mutex<SpawnCadence>>;

impl SpawnCadence {
    pub fn new(policy: NewBountyDelay, temperature: f64) -> Self {
        Self {
            policy,
            latest_route_len: None,
            temperature,
        }
    }

    pub fn shared(self) -> SharedCadence {
        Arc::new(Mutex::new(self))
    }

    pub fn next_delay(&self) -> Result<Duration> {
        self.policy
            .delay(self.latest_route_len, self.temperature, &mut rand::thread_rng())
    }
}

/// Delay generator reading the current cadence on every reschedule.
pub fn cadence_generator(cadence: &SharedCadence) -> DelayGenerator {
    let cadence = Arc::clone(cadence);
    delay_generator(move || cadence.lock().unwrap_or_else(|e| e.into_inner()).next_delay())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn fixed_is_constant() {
        let policy = NewBountyDelay::Fixed { secs: 90 };
        for temperature in [1.0, 50.0] {
            assert_eq!(
                policy.delay(Some(7), temperature, &mut rng()).unwrap(),
                Duration::from_secs(90)
            );
        }
    }

    #[test]
    fn random_stays_in_range() {
        let policy = NewBountyDelay::Random {
            min_secs: 10,
            max_secs: 20,
        };
        let mut rng = rng();
        for _ in 0..100 {
            let d = policy.delay(None, 1.0, &mut rng).unwrap();
            assert!(d >= Duration::from_secs(10) && d <= Duration::from_secs(20));
        }
    }

    #[test]
    fn route_scale_uses_fallback_before_first_spawn() {
        let policy = NewBountyDelay::FixedRouteScale {
            secs: 10,
            coefficient: 0.5,
            fallback_route_len: 4,
        };
        assert_eq!(
            policy.delay(None, 1.0, &mut rng()).unwrap(),
            Duration::from_secs(20)
        );
        assert_eq!(
            policy.delay(Some(6), 1.0, &mut rng()).unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn random_route_scale_multiplies_range() {
        let policy = NewBountyDelay::RandomRouteScale {
            min_secs: 10,
            max_secs: 10,
            coefficient: 2.0,
            fallback_route_len: 1,
        };
        assert_eq!(
            policy.delay(Some(3), 1.0, &mut rng()).unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn hotter_divisions_spawn_sooner() {
        let policy = NewBountyDelay::RandomRouteScaleTempScale {
            min_secs: 100,
            max_secs: 100,
            coefficient: 1.0,
            fallback_route_len: 1,
        };
        let cold = policy.delay(Some(1), 1.0, &mut rng()).unwrap();
        let hot = policy.delay(Some(1), 10.0, &mut rng()).unwrap();
        assert_eq!(cold, Duration::from_secs(100));
        assert!(hot < cold);
        // 100 * 10^-0.1 ≈ 79.43
        assert!((hot.as_secs_f64() - 79.43).abs() < 0.01);
    }

    #[test]
    fn non_positive_temperature_counts_as_one() {
        let policy = NewBountyDelay::default();
        let mut a = rng();
        let mut b = rng();
        assert_eq!(
            policy.delay(Some(2), 0.0, &mut a).unwrap(),
            policy.delay(Some(2), 1.0, &mut b).unwrap()
        );
    }

    #[test]
    fn empty_range_is_an_error() {
        let policy = NewBountyDelay::Random {
            min_secs: 5,
            max_secs: 1,
        };
        assert!(matches!(
            policy.delay(None, 1.0, &mut rng()),
            Err(BountyError::Config(_))
        ));
    }

    #[test]
    fn generator_tracks_cadence_changes() {
        let cadence = SpawnCadence::new(
            NewBountyDelay::FixedRouteScale {
                secs: 10,
                coefficient: 1.0,
                fallback_route_len: 1,
            },
            1.0,
        )
        .shared();
        let generator = cadence_generator(&cadence);
        assert_eq!(generator().unwrap(), Duration::from_secs(10));

        cadence.lock().unwrap().latest_route_len = Some(5);
        assert_eq!(generator().unwrap(), Duration::from_secs(50));
    }
}
