use crate::{
    context::{default_context, ExecutionContext},
    interval::{FixedInterval, IntervalPolicy, VariableInterval},
    leeway::Leeway,
    timer_core::{misuse, Action, TimerCore, TimerRef, TimerState},
    wakeup::{default_wakeup, WakeupSource},
    TimerError,
};
use std::{fmt, sync::Arc, time::Duration};

/// The lifecycle shared by all repeating timers
///
/// All methods take `&self`, so a timer can be shared between threads (e.g. in an [Arc](std::sync::Arc))
/// and controlled from any of them while it is firing on its execution context.
pub trait RepeatingTimer {
    /// Start the timer
    ///
    /// If `now` is `true` the first firing happens immediately,
    /// otherwise after the first interval. Starting a running timer does nothing.
    ///
    /// # Panics
    /// If the timer has been cancelled.
    fn start(&self, now: bool);

    /// Stop the timer without resetting the invocation count
    ///
    /// A firing that has already begun running its action completes,
    /// but no further firing happens until the timer is started again.
    /// Pausing a stopped timer does nothing.
    ///
    /// # Panics
    /// If the timer has been cancelled.
    fn pause(&self);

    /// Permanently cancel the timer
    ///
    /// The timer's wakeup handle is released and the timer never fires again.
    ///
    /// # Panics
    /// If the timer has already been cancelled.
    fn cancel(&self);

    /// The number of times the timer has fired
    fn invocations(&self) -> u64;

    /// Whether the timer has not been cancelled
    fn is_valid(&self) -> bool;

    /// Whether the timer is currently running
    fn is_running(&self) -> bool;

    /// The context the action is run on
    fn execution_context(&self) -> &Arc<dyn ExecutionContext>;
}

/// Called if the wakeup primitive for a new timer can not be allocated
pub type FailureHandler = Box<dyn FnOnce(&TimerError) + Send + 'static>;

/// Configures and builds a [FixedTimer](FixedTimer) or [VariableTimer](VariableTimer)
///
/// Options that are not set explicitly fall back to
/// [default_context](crate::context::default_context), [default_wakeup](crate::wakeup::default_wakeup)
/// and [Leeway::default](Leeway::default).
///
/// # Construction failure
/// If the wakeup handle can not be allocated, or the default context or wakeup thread
/// can not be spawned, [build](TimerBuilder::build) returns the error,
/// unless a failure handler was given with [on_failure](TimerBuilder::on_failure).
/// In that case the handler is called with the error and an already cancelled timer is returned.
pub struct TimerBuilder<K> {
    kind: K,
    context: Option<Arc<dyn ExecutionContext>>,
    wakeup: Option<Arc<dyn WakeupSource>>,
    leeway: Leeway,
    on_failure: Option<FailureHandler>,
}

impl<K> TimerBuilder<K> {
    fn with_kind(kind: K) -> Self {
        TimerBuilder {
            kind,
            context: None,
            wakeup: None,
            leeway: Leeway::default(),
            on_failure: None,
        }
    }

    /// Run the action on `context`
    pub fn execution_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Schedule firings through `wakeup`
    pub fn wakeup_source(mut self, wakeup: Arc<dyn WakeupSource>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    /// Grant each firing the given tolerance instead of the default 5%
    pub fn leeway(mut self, leeway: Leeway) -> Self {
        self.leeway = leeway;
        self
    }

    /// Call `handler` instead of failing if the timer can not be constructed
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&TimerError) + Send + 'static,
    {
        self.on_failure = Some(Box::new(handler));
        self
    }

    fn build_core(
        self,
        policy: Box<dyn IntervalPolicy>,
        action: Action,
    ) -> Result<(Arc<TimerCore>, K), TimerError> {
        let context = self.context.map_or_else(default_context, Ok);
        let wakeup = self.wakeup.map_or_else(default_wakeup, Ok);
        let (core, registration) = match (context, wakeup) {
            (Ok(context), Ok(wakeup)) => {
                let (core, registration) =
                    TimerCore::create(policy, action, context, wakeup, self.leeway);
                (core, registration.map_err(TimerError::from))
            }
            (Err(e), _) | (_, Err(e)) => (
                TimerCore::unavailable(policy, action, self.leeway),
                Err(TimerError::from(e)),
            ),
        };
        match registration {
            Ok(()) => Ok((core, self.kind)),
            Err(error) => {
                match self.on_failure {
                    Some(handler) => {
                        tracing::warn!(%error, "Timer construction failed, returning cancelled timer");
                        handler(&error);
                        Ok((core, self.kind))
                    }
                    None => Err(error),
                }
            }
        }
    }
}

impl TimerBuilder<Duration> {
    /// Build a timer running `action` every interval
    pub fn build<A>(self, action: A) -> Result<FixedTimer, TimerError>
    where
        A: FnMut(&TimerRef, u64) + Send + 'static,
    {
        let policy = Box::new(FixedInterval::new(self.kind));
        let (core, interval) = self.build_core(policy, Box::new(action))?;
        Ok(FixedTimer { core, interval })
    }
}

impl<F> TimerBuilder<Arc<F>>
where
    F: Fn(&TimerRef, u64) -> Duration + Send + Sync + 'static,
{
    /// Build a timer running `action` after each provided interval
    pub fn build<A>(self, action: A) -> Result<VariableTimer<F>, TimerError>
    where
        A: FnMut(&TimerRef, u64) + Send + 'static,
    {
        let policy = Box::new(VariableInterval::new(self.kind.clone()));
        let (core, provider) = self.build_core(policy, Box::new(action))?;
        Ok(VariableTimer { core, provider })
    }
}

impl<K: fmt::Debug> fmt::Debug for TimerBuilder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerBuilder")
            .field("kind", &self.kind)
            .field("leeway", &self.leeway)
            .field("has_context", &self.context.is_some())
            .field("has_wakeup", &self.wakeup.is_some())
            .field("has_failure_handler", &self.on_failure.is_some())
            .finish()
    }
}

/// A timer that fires at a constant interval
///
/// # Example
/// ```
/// # use std::sync::{Arc, Mutex};
/// # use std::time::Duration;
/// use repeating_timer::*;
///
/// let log: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
/// let log2 = log.clone();
/// let timer = FixedTimer::new(Duration::from_millis(20), move |timer, invocation| {
///     log2.lock().unwrap().push(invocation);
///     if invocation == 2 {
///         timer.pause();
///     }
/// })
/// .expect("timer");
/// timer.start(true);
/// while timer.is_running() {
///     std::thread::sleep(Duration::from_millis(5));
/// }
/// # std::thread::sleep(Duration::from_millis(50));
/// assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
/// timer.cancel();
/// assert!(!timer.is_valid());
/// ```
pub struct FixedTimer {
    core: Arc<TimerCore>,
    interval: Duration,
}

impl FixedTimer {
    /// Create a stopped timer with all default options
    ///
    /// See [builder](FixedTimer::builder) for the available options.
    pub fn new<A>(interval: Duration, action: A) -> Result<FixedTimer, TimerError>
    where
        A: FnMut(&TimerRef, u64) + Send + 'static,
    {
        Self::builder(interval).build(action)
    }

    /// Configure a timer that fires every `interval`
    pub fn builder(interval: Duration) -> TimerBuilder<Duration> {
        TimerBuilder::with_kind(interval)
    }

    /// The interval between firings
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The tolerance policy applied to each firing
    pub fn leeway(&self) -> Leeway {
        self.core.leeway()
    }

    /// A non-owning reference to this timer
    pub fn timer_ref(&self) -> TimerRef {
        self.core.timer_ref()
    }
}

impl RepeatingTimer for FixedTimer {
    fn start(&self, now: bool) {
        self.core.start(now).unwrap_or_else(|e| misuse(e));
    }

    fn pause(&self) {
        self.core.pause().unwrap_or_else(|e| misuse(e));
    }

    fn cancel(&self) {
        self.core.cancel().unwrap_or_else(|e| misuse(e));
    }

    fn invocations(&self) -> u64 {
        self.core.invocations()
    }

    fn is_valid(&self) -> bool {
        self.core.state() != TimerState::Invalid
    }

    fn is_running(&self) -> bool {
        self.core.state() == TimerState::Running
    }

    fn execution_context(&self) -> &Arc<dyn ExecutionContext> {
        self.core.execution_context()
    }
}

impl fmt::Debug for FixedTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedTimer(interval={:?}, {:?})", self.interval, self.core)
    }
}

/// A timer whose interval is recomputed before every firing
///
/// The interval provider is called with the index of the upcoming firing.
/// It is called at most once per index and with strictly increasing indices.
/// The provider runs while the timer holds its schedule lock, so it may inspect, pause
/// or cancel the timer, but must not start it.
///
/// # Example
/// ```
/// # use std::time::Duration;
/// use repeating_timer::*;
///
/// // back off linearly: 10ms, 20ms, 30ms, ...
/// let timer = VariableTimer::new(
///     |_: &TimerRef, next: u64| Duration::from_millis(10 * (next + 1)),
///     |timer, invocation| {
///         if invocation == 3 {
///             timer.cancel();
///         }
///     },
/// )
/// .expect("timer");
/// timer.start(false);
/// while timer.is_valid() {
///     std::thread::sleep(Duration::from_millis(5));
/// }
/// assert_eq!(timer.invocations(), 4);
/// ```
pub struct VariableTimer<F> {
    core: Arc<TimerCore>,
    provider: Arc<F>,
}

impl<F> VariableTimer<F>
where
    F: Fn(&TimerRef, u64) -> Duration + Send + Sync + 'static,
{
    /// Create a stopped timer with all default options
    ///
    /// See [builder](VariableTimer::builder) for the available options.
    pub fn new<A>(provider: F, action: A) -> Result<VariableTimer<F>, TimerError>
    where
        A: FnMut(&TimerRef, u64) + Send + 'static,
    {
        Self::builder(provider).build(action)
    }

    /// Configure a timer whose intervals come from `provider`
    pub fn builder(provider: F) -> TimerBuilder<Arc<F>> {
        TimerBuilder::with_kind(Arc::new(provider))
    }

    /// The interval provider
    pub fn interval_provider(&self) -> &F {
        &self.provider
    }

    /// The tolerance policy applied to each firing
    pub fn leeway(&self) -> Leeway {
        self.core.leeway()
    }

    /// A non-owning reference to this timer
    pub fn timer_ref(&self) -> TimerRef {
        self.core.timer_ref()
    }
}

impl<F> RepeatingTimer for VariableTimer<F> {
    fn start(&self, now: bool) {
        self.core.start(now).unwrap_or_else(|e| misuse(e));
    }

    fn pause(&self) {
        self.core.pause().unwrap_or_else(|e| misuse(e));
    }

    fn cancel(&self) {
        self.core.cancel().unwrap_or_else(|e| misuse(e));
    }

    fn invocations(&self) -> u64 {
        self.core.invocations()
    }

    fn is_valid(&self) -> bool {
        self.core.state() != TimerState::Invalid
    }

    fn is_running(&self) -> bool {
        self.core.state() == TimerState::Running
    }

    fn execution_context(&self) -> &Arc<dyn ExecutionContext> {
        self.core.execution_context()
    }
}

impl<F> fmt::Debug for VariableTimer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariableTimer(provider=<function>, {:?})", self.core)
    }
}
