//! Policies that decide how long a repeating timer waits before each firing.
//!
//! A [FixedInterval](FixedInterval) always waits the same time, while a
//! [VariableInterval](VariableInterval) asks a caller supplied provider for every firing.
//! Any [Duration] is a valid delay. A delay too long to be represented as a deadline
//! leaves the timer running, but it never fires again.

use crate::timer_core::TimerRef;
use std::{fmt, sync::Arc, time::Duration};

/// Produces the delay before each firing of a repeating timer
///
/// The timer asks its policy for the delay before firing number `index`
/// (counting from 0) right before it arms the wakeup for that firing.
/// Requests are made one at a time, and indices never decrease.
pub trait IntervalPolicy: Send {
    /// The delay until firing number `index`
    fn next_delay(&mut self, timer: &TimerRef, index: u64) -> Duration;
}

/// A constant delay between firings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval(Duration);

impl FixedInterval {
    /// A policy that always returns `interval`
    pub fn new(interval: Duration) -> Self {
        FixedInterval(interval)
    }

    /// The configured interval
    pub fn interval(&self) -> Duration {
        self.0
    }
}

impl IntervalPolicy for FixedInterval {
    fn next_delay(&mut self, _timer: &TimerRef, _index: u64) -> Duration {
        self.0
    }
}

/// A delay computed by a caller supplied provider
///
/// The provider is called at most once for any `index` and always with strictly increasing
/// indices. When the timer asks for the same index again, for example after being paused
/// and restarted, the delay computed the first time is returned instead.
pub struct VariableInterval<F> {
    provider: Arc<F>,
    last: Option<(u64, Duration)>,
}

impl<F> VariableInterval<F>
where
    F: Fn(&TimerRef, u64) -> Duration + Send + Sync + 'static,
{
    /// Wrap `provider` into a policy
    pub fn new(provider: Arc<F>) -> Self {
        VariableInterval {
            provider,
            last: None,
        }
    }

    /// The wrapped provider
    pub fn provider(&self) -> &Arc<F> {
        &self.provider
    }
}

impl<F> IntervalPolicy for VariableInterval<F>
where
    F: Fn(&TimerRef, u64) -> Duration + Send + Sync + 'static,
{
    fn next_delay(&mut self, timer: &TimerRef, index: u64) -> Duration {
        match self.last {
            Some((last_index, delay)) if last_index == index => delay,
            Some((last_index, delay)) if last_index > index => {
                debug_assert!(
                    false,
                    "interval requested for index {} after index {}",
                    index, last_index
                );
                tracing::error!(
                    index,
                    last_index,
                    "Interval requested out of order, reusing the last delay"
                );
                delay
            }
            _ => {
                let delay = (self.provider)(timer, index);
                self.last = Some((index, delay));
                delay
            }
        }
    }
}

impl<F> fmt::Debug for VariableInterval<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VariableInterval(provider=<function>, last={:?})",
            self.last
        )
    }
}
