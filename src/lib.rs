//! This crate provides repeating timers that invoke an action at a fixed or variable interval
//! on an execution context, until they are paused or cancelled.
//!
//! The APIs in the crate are layered, listed below from lowest to highest.
//!
//! # 1 – Wakeup Primitive
//! The [wakeup](wakeup) module provides one-off wakeups: a handle is armed with a deadline
//! and a leeway, and its handler is delivered once on the handle's execution context.
//! The [WakeupThread](wakeup::WakeupThread) implementation drives all handles from a single
//! dedicated thread and uses the leeway of each wakeup to batch deliveries.
//!
//! # 2 – Execution Contexts
//! Actions never run on the wakeup thread, but are handed to an
//! [ExecutionContext](context::ExecutionContext), a FIFO queue of jobs.
//! The [WorkQueue](context::WorkQueue) runs jobs on a pool of worker threads.
//! If no context is given, timers use a process-wide [default](context::default_context).
//!
//! # 3 – Repeating Timers
//! A [FixedTimer](FixedTimer) fires at a constant interval, while a [VariableTimer](VariableTimer)
//! asks a provider for the delay before each firing. Both share the same lifecycle,
//! described by the [RepeatingTimer](RepeatingTimer) trait:
//!
//! - New timers are stopped.
//! - [start](RepeatingTimer::start) begins firing, either immediately or after the first interval.
//! - [pause](RepeatingTimer::pause) stops firing, but keeps the invocation count.
//! - [cancel](RepeatingTimer::cancel) releases the timer's wakeup handle for good.
//!
//! Starting, pausing or cancelling a cancelled timer is a programming error and panics.
//!
//! Each firing is granted a tolerance (the [Leeway](Leeway)) of 5% of its delay by default,
//! which trades some precision for fewer wakeups.
//!
//! # Example
//! ```
//! # use std::sync::{Arc, Mutex};
//! # use std::time::Duration;
//! use repeating_timer::*;
//!
//! let ticks = Arc::new(Mutex::new(0u64));
//! let ticks2 = ticks.clone();
//! let timer = FixedTimer::new(Duration::from_millis(10), move |_timer, invocation| {
//!     *ticks2.lock().unwrap() = invocation + 1;
//! })
//! .expect("timer");
//! timer.start(true);
//! while *ticks.lock().unwrap() < 5 {
//!     std::thread::sleep(Duration::from_millis(1));
//! }
//! timer.cancel();
//! assert!(timer.invocations() >= 5);
//! ```

#![deny(missing_docs)]

pub mod context;
mod error;
pub mod interval;
mod leeway;
mod timer_core;
mod timers;
pub mod wakeup;

pub use self::{
    error::{TimerError, WakeupError},
    leeway::{Leeway, DEFAULT_LEEWAY_FRACTION},
    timer_core::{Action, TimerRef, TimerState},
    timers::*,
};

#[cfg(test)]
pub(crate) mod test_helpers;
