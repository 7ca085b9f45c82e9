use crate::TimerError;
use std::time::Duration;

/// The fraction of a delay that a firing may be deferred by when no other value is configured
pub const DEFAULT_LEEWAY_FRACTION: f64 = 0.05;

/// Derives the tolerance window granted to each firing from its delay
///
/// A wakeup with delay `d` may be delivered anywhere in `[d, d + leeway]`,
/// which allows the wakeup thread to serve several timers with one wakeup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leeway {
    fraction: f64,
}

impl Leeway {
    /// Create a leeway policy granting `fraction` of each delay as tolerance
    pub fn new(fraction: f64) -> Result<Self, TimerError> {
        if fraction.is_finite() && fraction >= 0.0 {
            Ok(Leeway { fraction })
        } else {
            Err(TimerError::InvalidLeeway(fraction))
        }
    }

    /// A policy that grants no tolerance at all
    pub fn none() -> Self {
        Leeway { fraction: 0.0 }
    }

    /// The configured fraction
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// The tolerance for a firing scheduled `delay` into the future
    pub fn of(&self, delay: Duration) -> Duration {
        // float casts saturate, so huge delays clamp instead of wrapping
        let nanos = (delay.as_nanos() as f64 * self.fraction).round();
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for Leeway {
    fn default() -> Self {
        Leeway {
            fraction: DEFAULT_LEEWAY_FRACTION,
        }
    }
}
