//! Jittered rotation timer.
//!
//! Each delay is drawn uniformly from `[min, max]`, so the rotation
//! cadence cannot be predicted from outside. The timer feeds `Scheduled`
//! triggers into the same channel as manual requests.

use std::time::Duration;

use carousel_core::Trigger;
use rand::{Rng, RngCore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RotationError;
use crate::handle::RotationHandle;

/// Uniformly jittered interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterSchedule {
    min: Duration,
    max: Duration,
}

impl JitterSchedule {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min, self.max)
    }

    /// Draw the delay until the next scheduled trigger.
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if min == max {
            return self.min;
        }
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

/// Background task firing `Scheduled` triggers at jittered intervals.
pub struct TriggerTimer {
    schedule: JitterSchedule,
    rng: Box<dyn RngCore + Send>,
    handle: RotationHandle,
}

impl TriggerTimer {
    pub fn new(schedule: JitterSchedule, rng: Box<dyn RngCore + Send>, handle: RotationHandle) -> Self {
        Self {
            schedule,
            rng,
            handle,
        }
    }

    /// Run until shutdown or until the controller goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let (min, max) = self.schedule.bounds();
        info!(?min, ?max, "rotation timer started");

        loop {
            let delay = self.schedule.next_delay(&mut *self.rng);
            debug!(?delay, "next scheduled rotation");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match self.handle.rotate(Trigger::Scheduled).await {
                        Ok(plan) => debug!(plan, "scheduled rotation accepted"),
                        Err(RotationError::RotationInProgress) => {
                            debug!("scheduled rotation skipped, cycle in progress");
                        }
                        Err(RotationError::ControllerStopped) => break,
                        Err(e) => warn!(error = %e, "scheduled rotation rejected"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("rotation timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn delays_stay_within_bounds() {
        let schedule = JitterSchedule::new(Duration::from_secs(60), Duration::from_secs(300));
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..500 {
            let d = schedule.next_delay(&mut rng);
            assert!(d >= Duration::from_secs(60) && d <= Duration::from_secs(300));
        }
    }

    #[test]
    fn delays_are_jittered() {
        let schedule = JitterSchedule::new(Duration::from_secs(60), Duration::from_secs(300));
        let mut rng = StdRng::seed_from_u64(9);
        let first = schedule.next_delay(&mut rng);
        assert!((0..20).any(|_| schedule.next_delay(&mut rng) != first));
    }

    #[test]
    fn fixed_interval_when_bounds_equal() {
        let schedule = JitterSchedule::new(Duration::from_secs(90), Duration::from_secs(90));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(schedule.next_delay(&mut rng), Duration::from_secs(90));
    }

    #[test]
    fn inverted_bounds_are_swapped() {
        let schedule = JitterSchedule::new(Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(schedule.bounds(), (Duration::from_secs(5), Duration::from_secs(10)));
    }

    #[test]
    fn seeded_schedule_is_reproducible() {
        let schedule = JitterSchedule::new(Duration::from_secs(1), Duration::from_secs(100));
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..5).map(|_| schedule.next_delay(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(11), draw(11));
    }
}
