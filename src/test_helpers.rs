//! Convenience functions and deterministic test doubles for timer tests

use crate::{
    context::{ExecutionContext, Job},
    wakeup::{Handler, WakeupHandle, WakeupSource},
    WakeupError,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use uuid::Uuid;

/// Produce a duration corresponding to the i:th Fibonacci number
///
/// Good for testing timer implementations at large a variety of timeout delays.
pub fn fib_time(mut i: usize) -> Duration {
    if i == 0 {
        Duration::from_millis(0)
    } else if i == 1 {
        Duration::from_millis(1)
    } else {
        let mut fminus2: u64 = 0u64;
        let mut fminus1: u64 = 1u64;
        while i >= 2 {
            let fi = fminus2 + fminus1;
            i -= 1;
            fminus2 = fminus1;
            fminus1 = fi;
        }
        Duration::from_millis(fminus1)
    }
}

/// A context that only runs jobs when told to
#[derive(Default)]
pub struct ManualContext {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run queued jobs, including ones they enqueue, and return how many ran
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.jobs.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }
}

impl ExecutionContext for ManualContext {
    fn submit(&self, job: Job) {
        self.jobs.lock().unwrap().push_back(job);
    }
}

struct Registration {
    context: Arc<dyn ExecutionContext>,
    handler: Handler,
    armed: Option<(Instant, Duration, u64)>,
}

#[derive(Default)]
struct ManualState {
    registrations: HashMap<Uuid, Registration>,
    total_registrations: usize,
    arms: usize,
    releases: usize,
}

/// A wakeup source that never fires on its own
///
/// Tests deliver the pending wakeup explicitly via [fire](ManualWakeup::fire).
/// It is meant for a single registered handle.
#[derive(Default)]
pub struct ManualWakeup {
    state: Mutex<ManualState>,
    failing: bool,
}

impl ManualWakeup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A source that rejects every registration
    pub fn failing() -> Arc<Self> {
        Arc::new(ManualWakeup {
            state: Mutex::default(),
            failing: true,
        })
    }

    /// The pending `(deadline, leeway)`, if any
    pub fn armed(&self) -> Option<(Instant, Duration)> {
        let state = self.state.lock().unwrap();
        state
            .registrations
            .values()
            .find_map(|r| r.armed.map(|(deadline, leeway, _)| (deadline, leeway)))
    }

    /// The pending `(deadline, tag)`, if any
    pub fn armed_tag(&self) -> Option<(Instant, u64)> {
        let state = self.state.lock().unwrap();
        state
            .registrations
            .values()
            .find_map(|r| r.armed.map(|(deadline, _, tag)| (deadline, tag)))
    }

    /// Submit a delivery with the given values, regardless of what is armed
    pub fn deliver(&self, deadline: Instant, tag: u64) {
        let state = self.state.lock().unwrap();
        for registration in state.registrations.values() {
            let handler = registration.handler.clone();
            registration
                .context
                .submit(Box::new(move || handler(deadline, tag)));
        }
    }

    /// Submit the pending wakeup to its context, returns `false` if nothing was armed
    pub fn fire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let due = state
            .registrations
            .values_mut()
            .find_map(|r| r.armed.take().map(|(deadline, _, tag)| (r, deadline, tag)));
        match due {
            Some((registration, deadline, tag)) => {
                let handler = registration.handler.clone();
                registration
                    .context
                    .submit(Box::new(move || handler(deadline, tag)));
                true
            }
            None => false,
        }
    }

    pub fn registrations(&self) -> usize {
        self.state.lock().unwrap().total_registrations
    }

    pub fn arm_count(&self) -> usize {
        self.state.lock().unwrap().arms
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }
}

impl WakeupSource for ManualWakeup {
    fn register(
        &self,
        context: Arc<dyn ExecutionContext>,
        handler: Handler,
    ) -> Result<WakeupHandle, WakeupError> {
        if self.failing {
            return Err(WakeupError::Disconnected);
        }
        let handle = WakeupHandle::with_random_id();
        let mut state = self.state.lock().unwrap();
        state.total_registrations += 1;
        state.registrations.insert(
            *handle.id(),
            Registration {
                context,
                handler,
                armed: None,
            },
        );
        Ok(handle)
    }

    fn arm(&self, handle: &WakeupHandle, deadline: Instant, leeway: Duration, tag: u64) {
        let mut state = self.state.lock().unwrap();
        state.arms += 1;
        if let Some(r) = state.registrations.get_mut(handle.id()) {
            r.armed = Some((deadline, leeway, tag));
        }
    }

    fn disarm(&self, handle: &WakeupHandle) {
        if let Some(r) = self.state.lock().unwrap().registrations.get_mut(handle.id()) {
            r.armed = None;
        }
    }

    fn release(&self, handle: WakeupHandle) {
        let mut state = self.state.lock().unwrap();
        state.releases += 1;
        state.registrations.remove(handle.id());
    }
}
