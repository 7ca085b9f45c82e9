//! The state machine and firing loop shared by all repeating timers.
//!
//! A [TimerCore](TimerCore) owns exactly one [WakeupHandle](WakeupHandle) and arms it once per firing.
//! When the wakeup is delivered on the execution context, the core runs the action,
//! asks its [IntervalPolicy](IntervalPolicy) for the next delay and arms the handle again,
//! unless the timer has been paused or cancelled in the meantime.
//!
//! Concurrent lifecycle calls are serialised through a single atomic [TimerState](TimerState).
//! Every arm is tagged with a new epoch, and a delivered wakeup whose epoch is no longer
//! the armed one is ignored. This keeps a `pause` + `start` cycle from producing two
//! outstanding firings for the same timer.
//!
//! A delay so long that its deadline can not be represented as an [Instant] leaves the
//! timer running without arming it, so it never fires.

use crate::{
    context::{ExecutionContext, Job},
    interval::IntervalPolicy,
    leeway::Leeway,
    wakeup::{Handler, WakeupHandle, WakeupSource},
    TimerError,
    WakeupError,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::{Duration, Instant},
};

/// The action run on every firing
///
/// It receives a non-owning reference to its timer and the index of the firing,
/// starting at 0.
pub type Action = Box<dyn FnMut(&TimerRef, u64) + Send + 'static>;

/// The lifecycle state of a timer
///
/// `Stopped` and `Running` are both valid states. Cancelling moves a timer to
/// `Invalid`, which is terminal and never running.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerState {
    /// Armed but not firing, either new or paused
    Stopped = 0,
    /// Firing at the configured intervals
    Running = 1,
    /// Cancelled for good
    Invalid = 2,
}

impl TimerState {
    fn from_u8(raw: u8) -> TimerState {
        match raw {
            0 => TimerState::Stopped,
            1 => TimerState::Running,
            2 => TimerState::Invalid,
            _ => unreachable!("Only TimerState values are ever stored"),
        }
    }
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: TimerState) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    fn load(&self) -> TimerState {
        TimerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn transition(&self, from: TimerState, to: TimerState) -> Result<(), TimerState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(TimerState::from_u8)
    }
}

struct Schedule {
    policy: Box<dyn IntervalPolicy>,
    /// The epoch of the arm whose delivery is still expected
    armed: Option<u64>,
    epoch: u64,
}

pub(crate) struct TimerCore {
    state: AtomicState,
    invocations: AtomicU64,
    schedule: Mutex<Schedule>,
    action: Mutex<Action>,
    leeway: Leeway,
    context: Arc<dyn ExecutionContext>,
    wakeup: Arc<dyn WakeupSource>,
    handle: Mutex<Option<WakeupHandle>>,
    self_ref: Weak<TimerCore>,
}

// Actions may panic on the execution context; the core stays usable after that.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TimerCore {
    /// Create a new core and register its firing callback with `wakeup`
    ///
    /// If the registration fails, the core is returned in the `Invalid` state
    /// together with the error.
    pub(crate) fn create(
        policy: Box<dyn IntervalPolicy>,
        action: Action,
        context: Arc<dyn ExecutionContext>,
        wakeup: Arc<dyn WakeupSource>,
        leeway: Leeway,
    ) -> (Arc<TimerCore>, Result<(), WakeupError>) {
        let mut registration = Ok(());
        let core = Arc::new_cyclic(|weak: &Weak<TimerCore>| {
            let target = weak.clone();
            let handler: Handler = Arc::new(move |deadline, epoch| {
                if let Some(core) = target.upgrade() {
                    core.fire(deadline, epoch);
                }
            });
            let (state, handle) = match wakeup.register(context.clone(), handler) {
                Ok(handle) => (TimerState::Stopped, Some(handle)),
                Err(e) => {
                    registration = Err(e);
                    (TimerState::Invalid, None)
                }
            };
            TimerCore {
                state: AtomicState::new(state),
                invocations: AtomicU64::new(0),
                schedule: Mutex::new(Schedule {
                    policy,
                    armed: None,
                    epoch: 0,
                }),
                action: Mutex::new(action),
                leeway,
                context,
                wakeup,
                handle: Mutex::new(handle),
                self_ref: weak.clone(),
            }
        });
        (core, registration)
    }

    /// A cancelled core for a timer whose execution context or wakeup source could not be set up
    pub(crate) fn unavailable(
        policy: Box<dyn IntervalPolicy>,
        action: Action,
        leeway: Leeway,
    ) -> Arc<TimerCore> {
        let (core, _) = TimerCore::create(
            policy,
            action,
            Arc::new(Unavailable),
            Arc::new(Unavailable),
            leeway,
        );
        core
    }

    pub(crate) fn state(&self) -> TimerState {
        self.state.load()
    }

    pub(crate) fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub(crate) fn execution_context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    pub(crate) fn leeway(&self) -> Leeway {
        self.leeway
    }

    pub(crate) fn timer_ref(&self) -> TimerRef {
        TimerRef {
            core: self.self_ref.clone(),
        }
    }

    pub(crate) fn start(&self, now: bool) -> Result<(), TimerError> {
        match self.state.transition(TimerState::Stopped, TimerState::Running) {
            Ok(()) => (),
            Err(TimerState::Running) => return Ok(()),
            Err(TimerState::Invalid) => return Err(TimerError::invalid("start")),
            Err(TimerState::Stopped) => unreachable!("compare_exchange failed on a matching value"),
        }
        tracing::debug!(now, invocations = self.invocations(), "Starting timer");
        let mut schedule = lock(&self.schedule);
        let base = Instant::now();
        let delay = if now {
            Duration::ZERO
        } else {
            let index = self.invocations();
            schedule.policy.next_delay(&self.timer_ref(), index)
        };
        self.arm(&mut schedule, base.checked_add(delay), delay);
        Ok(())
    }

    pub(crate) fn pause(&self) -> Result<(), TimerError> {
        match self.state.transition(TimerState::Running, TimerState::Stopped) {
            Ok(()) => {
                tracing::debug!(invocations = self.invocations(), "Paused timer");
                Ok(())
            }
            Err(TimerState::Stopped) => Ok(()),
            Err(TimerState::Invalid) => Err(TimerError::invalid("pause")),
            Err(TimerState::Running) => unreachable!("compare_exchange failed on a matching value"),
        }
    }

    pub(crate) fn cancel(&self) -> Result<(), TimerError> {
        let mut current = self.state.load();
        loop {
            if current == TimerState::Invalid {
                return Err(TimerError::invalid("cancel"));
            }
            match self.state.transition(current, TimerState::Invalid) {
                Ok(()) => break,
                Err(actual) => current = actual,
            }
        }
        // only the caller that won the transition gets here
        tracing::debug!(invocations = self.invocations(), "Cancelled timer");
        self.release_handle();
        Ok(())
    }

    fn release_handle(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            self.wakeup.release(handle);
        }
    }

    fn arm(&self, schedule: &mut Schedule, deadline: Option<Instant>, delay: Duration) {
        schedule.epoch += 1;
        schedule.armed = Some(schedule.epoch);
        let deadline = match deadline {
            Some(deadline) => deadline,
            None => {
                tracing::warn!(?delay, "Deadline out of range, the timer will not fire");
                return;
            }
        };
        let leeway = self.leeway.of(delay);
        if let Some(handle) = lock(&self.handle).as_ref() {
            tracing::trace!(?delay, ?leeway, epoch = schedule.epoch, "Arming timer");
            self.wakeup.arm(handle, deadline, leeway, schedule.epoch);
        }
    }

    /// The firing callback, run on the execution context
    fn fire(&self, deadline: Instant, epoch: u64) {
        let mut action = lock(&self.action);
        if lock(&self.schedule).armed != Some(epoch) {
            tracing::trace!("Ignoring stale wakeup");
            return;
        }
        if self.state.load() != TimerState::Running {
            return;
        }
        let index = self.invocations.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(index, "Firing timer");
        (*action)(&self.timer_ref(), index);
        self.reschedule(deadline, epoch, index + 1);
    }

    fn reschedule(&self, fired: Instant, epoch: u64, next_index: u64) {
        let mut schedule = lock(&self.schedule);
        if schedule.armed != Some(epoch) {
            // restarted while the action was running, that start armed the handle already
            return;
        }
        if self.state.load() != TimerState::Running {
            schedule.armed = None;
            return;
        }
        let delay = schedule.policy.next_delay(&self.timer_ref(), next_index);
        // anchor on the previous deadline, so lateness does not accumulate
        let deadline = fired
            .checked_add(delay)
            .map(|deadline| deadline.max(Instant::now()));
        self.arm(&mut schedule, deadline, delay);
    }
}

impl Drop for TimerCore {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.wakeup.release(handle);
        }
    }
}

impl fmt::Debug for TimerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimerCore(state={:?}, invocations={}, leeway={:?})",
            self.state(),
            self.invocations(),
            self.leeway
        )
    }
}

/// Neither runs jobs nor accepts registrations
struct Unavailable;

impl ExecutionContext for Unavailable {
    fn submit(&self, _job: Job) {
        tracing::warn!("Dropping job submitted to a timer that could not be constructed");
    }
}

impl WakeupSource for Unavailable {
    fn register(
        &self,
        _context: Arc<dyn ExecutionContext>,
        _handler: Handler,
    ) -> Result<WakeupHandle, WakeupError> {
        Err(WakeupError::Disconnected)
    }

    fn arm(&self, _handle: &WakeupHandle, _deadline: Instant, _leeway: Duration, _tag: u64) {}

    fn disarm(&self, _handle: &WakeupHandle) {}

    fn release(&self, _handle: WakeupHandle) {}
}

/// A non-owning reference to a repeating timer
///
/// This is what actions and interval providers are given, so they can inspect and control
/// their own timer without keeping it alive.
/// Once the owning timer has been dropped, queries report a cancelled timer and
/// lifecycle calls do nothing.
///
/// # Panics
/// Just like on the owning timer, calling [start](TimerRef::start), [pause](TimerRef::pause)
/// or [cancel](TimerRef::cancel) on a cancelled timer panics.
#[derive(Clone)]
pub struct TimerRef {
    core: Weak<TimerCore>,
}

impl TimerRef {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        TimerRef { core: Weak::new() }
    }

    /// The number of firings so far, or `None` if the timer is gone
    pub fn invocations(&self) -> Option<u64> {
        self.core.upgrade().map(|core| core.invocations())
    }

    /// Whether the timer is still alive and has not been cancelled
    pub fn is_valid(&self) -> bool {
        self.core
            .upgrade()
            .map_or(false, |core| core.state() != TimerState::Invalid)
    }

    /// Whether the timer is still alive and running
    pub fn is_running(&self) -> bool {
        self.core
            .upgrade()
            .map_or(false, |core| core.state() == TimerState::Running)
    }

    /// See [RepeatingTimer::start](crate::RepeatingTimer::start)
    ///
    /// Must not be called from an interval provider.
    pub fn start(&self, now: bool) {
        if let Some(core) = self.core.upgrade() {
            core.start(now).unwrap_or_else(|e| misuse(e));
        }
    }

    /// See [RepeatingTimer::pause](crate::RepeatingTimer::pause)
    pub fn pause(&self) {
        if let Some(core) = self.core.upgrade() {
            core.pause().unwrap_or_else(|e| misuse(e));
        }
    }

    /// See [RepeatingTimer::cancel](crate::RepeatingTimer::cancel)
    pub fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            core.cancel().unwrap_or_else(|e| misuse(e));
        }
    }
}

impl fmt::Debug for TimerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core.upgrade() {
            Some(core) => write!(f, "TimerRef({:?})", core),
            None => write!(f, "TimerRef(<dropped>)"),
        }
    }
}

/// Lifecycle misuse is a bug in the caller, never a condition to recover from
pub(crate) fn misuse(e: TimerError) -> ! {
    panic!("{}", e)
}
