//! This module provides the wakeup primitive that repeating timers are built on.
//!
//! A [WakeupSource](WakeupSource) hands out [handles](WakeupHandle), each bound to a handler
//! and an [ExecutionContext](crate::context::ExecutionContext). Arming a handle schedules exactly one
//! delivery of its handler on that context at (or shortly after) the given deadline.
//! Arming again replaces any delivery that is still pending, so there is never more
//! than one outstanding wakeup per handle.
//! Each arm carries a caller chosen tag that is handed back with the delivery,
//! so the receiver can tell which arm a delivery belongs to.
//!
//! The implementation in this module runs on its own dedicated thread and uses a shareable
//! handle called a `WakeupRef` for communication with other threads.
//! This inter-thread communication is based on [crossbeam_channel](crossbeam_channel).
//!
//! # Leeway
//! Every armed wakeup carries a leeway, so its delivery window is `[deadline, deadline + leeway]`.
//! The wakeup thread uses this to serve several handles with a single wakeup: it sleeps until the
//! latest pending deadline that can be reached without closing any pending window,
//! and then delivers everything that is due in one batch.
//! A wakeup without overlapping neighbours is delivered at its deadline.
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use std::time::{Duration, Instant};
//! use repeating_timer::context::WorkQueue;
//! use repeating_timer::wakeup::*;
//!
//! let wakeup_thread = WakeupThread::new().expect("wakeup thread");
//! let wakeup = wakeup_thread.wakeup_ref();
//! let queue = Arc::new(WorkQueue::serial().expect("queue"));
//!
//! let (s, r) = crossbeam_channel::bounded(1);
//! let handle = wakeup
//!     .register(queue, Arc::new(move |deadline, tag| { let _ = s.try_send((deadline, tag)); }))
//!     .expect("register");
//! let deadline = Instant::now() + Duration::from_millis(50);
//! wakeup.arm(&handle, deadline, Duration::from_millis(5), 7);
//! assert_eq!(r.recv_timeout(Duration::from_secs(5)), Ok((deadline, 7)));
//! wakeup.release(handle);
//! wakeup_thread
//!     .shutdown()
//!     .expect("Wakeup thread didn't shutdown properly!");
//! ```

use crate::{context::ExecutionContext, WakeupError};
use channel::select;
use crossbeam_channel as channel;
use std::{
    collections::BTreeMap,
    fmt, io,
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};
use uuid::Uuid;

#[cfg(feature = "fx-hash")]
type HandleMap<V> = rustc_hash::FxHashMap<Uuid, V>;
#[cfg(all(feature = "fnv-hash", not(feature = "fx-hash")))]
type HandleMap<V> = fnv::FnvHashMap<Uuid, V>;
#[cfg(not(any(feature = "fx-hash", feature = "fnv-hash")))]
type HandleMap<V> = std::collections::HashMap<Uuid, V>;

/// The callback invoked for every delivered wakeup
///
/// It is given the deadline and the tag the handle was armed with.
pub type Handler = Arc<dyn Fn(Instant, u64) + Send + Sync + 'static>;

/// The longest the driver blocks without rechecking its schedule
const MAX_SLEEP: Duration = Duration::from_secs(3600);

/// An exclusively owned registration with a [WakeupSource](WakeupSource)
///
/// Handles cannot be cloned. Giving one back via [release](WakeupSource::release)
/// ends the registration for good.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct WakeupHandle {
    id: Uuid,
}

impl WakeupHandle {
    pub(crate) fn with_random_id() -> Self {
        WakeupHandle { id: Uuid::new_v4() }
    }

    /// The unique id of this registration
    pub fn id(&self) -> &Uuid {
        &self.id
    }
}

/// A primitive that delivers one-off wakeups on an execution context
pub trait WakeupSource: Send + Sync {
    /// Register `handler` to be run on `context` whenever the returned handle fires
    ///
    /// Fails if the primitive can not take any more registrations.
    fn register(
        &self,
        context: Arc<dyn ExecutionContext>,
        handler: Handler,
    ) -> Result<WakeupHandle, WakeupError>;

    /// Schedule a single delivery for `handle` in the window `[deadline, deadline + leeway]`
    ///
    /// The handler receives `deadline` and `tag` on delivery.
    /// This replaces any delivery of the same handle that is still pending.
    fn arm(&self, handle: &WakeupHandle, deadline: Instant, leeway: Duration, tag: u64);

    /// Drop the pending delivery for `handle`, if any
    fn disarm(&self, handle: &WakeupHandle);

    /// End the registration, dropping any pending delivery
    fn release(&self, handle: WakeupHandle);
}

enum WakeupMsg {
    Register {
        id: Uuid,
        context: Arc<dyn ExecutionContext>,
        handler: Handler,
    },
    Arm {
        id: Uuid,
        deadline: Instant,
        leeway: Duration,
        tag: u64,
    },
    Disarm(Uuid),
    Release(Uuid),
    Stop,
}

impl fmt::Debug for WakeupMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeupMsg::Register { id, .. } => write!(f, "Register({})", id),
            WakeupMsg::Arm {
                id,
                deadline,
                leeway,
                tag,
            } => write!(
                f,
                "Arm({}, {:?}, leeway={:?}, tag={})",
                id, deadline, leeway, tag
            ),
            WakeupMsg::Disarm(id) => write!(f, "Disarm({})", id),
            WakeupMsg::Release(id) => write!(f, "Release({})", id),
            WakeupMsg::Stop => write!(f, "Stop"),
        }
    }
}

/// A reference to a wakeup thread
///
/// This is used to register and arm wakeups from other threads.
///
/// You can get an instance via [wakeup_ref](WakeupThread::wakeup_ref).
#[derive(Clone)]
pub struct WakeupRef {
    work_queue: channel::Sender<WakeupMsg>,
}

impl WakeupSource for WakeupRef {
    fn register(
        &self,
        context: Arc<dyn ExecutionContext>,
        handler: Handler,
    ) -> Result<WakeupHandle, WakeupError> {
        let handle = WakeupHandle::with_random_id();
        let msg = WakeupMsg::Register {
            id: handle.id,
            context,
            handler,
        };
        self.work_queue
            .send(msg)
            .map_err(|_| WakeupError::Disconnected)?;
        Ok(handle)
    }

    fn arm(&self, handle: &WakeupHandle, deadline: Instant, leeway: Duration, tag: u64) {
        let msg = WakeupMsg::Arm {
            id: handle.id,
            deadline,
            leeway,
            tag,
        };
        self.work_queue
            .send(msg)
            .unwrap_or_else(|e| tracing::warn!("Could not send Arm msg: {:?}", e.0));
    }

    fn disarm(&self, handle: &WakeupHandle) {
        self.work_queue
            .send(WakeupMsg::Disarm(handle.id))
            .unwrap_or_else(|e| tracing::warn!("Could not send Disarm msg: {:?}", e.0));
    }

    fn release(&self, handle: WakeupHandle) {
        self.work_queue
            .send(WakeupMsg::Release(handle.id))
            .unwrap_or_else(|e| tracing::warn!("Could not send Release msg: {:?}", e.0));
    }
}

impl fmt::Debug for WakeupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<WakeupRef>")
    }
}

/// A wakeup source that uses its own thread
///
/// This struct acts as a main handle for the driver and its thread.
pub struct WakeupThread {
    driver_thread: thread::JoinHandle<()>,
    work_queue: channel::Sender<WakeupMsg>,
}

impl WakeupThread {
    /// Create a new wakeup source with its own thread.
    ///
    /// The thread will be called `"wakeup-thread"`.
    pub fn new() -> io::Result<WakeupThread> {
        let (s, r) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("wakeup-thread".to_string())
            .spawn(move || {
                let driver = DriverThread::new(r);
                driver.run();
            })?;
        Ok(WakeupThread {
            driver_thread: handle,
            work_queue: s,
        })
    }

    /// Returns a shareable reference to this wakeup source
    pub fn wakeup_ref(&self) -> WakeupRef {
        WakeupRef {
            work_queue: self.work_queue.clone(),
        }
    }

    /// Shut this wakeup source down
    ///
    /// Pending wakeups are dropped without being delivered.
    /// In particular, this method waits for the driver thread to be
    /// joined, or returns an error.
    pub fn shutdown(self) -> Result<(), WakeupThreadError> {
        self.work_queue
            .send(WakeupMsg::Stop)
            .unwrap_or_else(|e| tracing::warn!("Could not send Stop msg: {:?}", e.0));
        match self.driver_thread.join() {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::error!("Wakeup thread panicked!");
                Err(WakeupThreadError::CouldNotJoinThread)
            }
        }
    }

    /// Same as [shutdown](WakeupThread::shutdown), but doesn't wait for the thread to join
    pub fn shutdown_async(&self) -> Result<(), WakeupThreadError> {
        self.work_queue
            .send(WakeupMsg::Stop)
            .map_err(|_| WakeupThreadError::CouldNotSendStop)
    }
}

impl fmt::Debug for WakeupThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<WakeupThread>")
    }
}

/// Errors that can occur when stopping the wakeup thread
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WakeupThreadError {
    /// Sending of the `Stop` message failed
    #[error("could not send the stop message to the wakeup thread")]
    CouldNotSendStop,
    /// Joining of the driver thread failed
    #[error("the wakeup thread panicked")]
    CouldNotJoinThread,
}

/// The process-wide wakeup source used by timers that are not given one explicitly
///
/// The thread is started on first use and lives for the rest of the process.
/// Fails if the thread can not be spawned; the next call tries again.
pub fn default_wakeup() -> io::Result<Arc<dyn WakeupSource>> {
    static DEFAULT: OnceLock<WakeupThread> = OnceLock::new();
    if let Some(driver) = DEFAULT.get() {
        return Ok(Arc::new(driver.wakeup_ref()));
    }
    tracing::debug!("Starting default wakeup thread");
    let started = WakeupThread::new()?;
    // if another caller won the race, `started` is dropped and its thread exits
    let driver = DEFAULT.get_or_init(|| started);
    Ok(Arc::new(driver.wakeup_ref()))
}

// Position in the schedule; the sequence number keeps equal deadlines apart
type ScheduleKey = (Instant, u64);

struct Slot {
    context: Arc<dyn ExecutionContext>,
    handler: Handler,
    pending: Option<ScheduleKey>,
}

struct Pending {
    id: Uuid,
    leeway: Duration,
    tag: u64,
}

struct DriverThread {
    slots: HandleMap<Slot>,
    schedule: BTreeMap<ScheduleKey, Pending>,
    work_queue: channel::Receiver<WakeupMsg>,
    running: bool,
    next_seq: u64,
}

impl DriverThread {
    fn new(work_queue: channel::Receiver<WakeupMsg>) -> DriverThread {
        DriverThread {
            slots: HandleMap::default(),
            schedule: BTreeMap::new(),
            work_queue,
            running: true,
            next_seq: 0,
        }
    }

    fn run(mut self) {
        while self.running {
            let now = Instant::now();
            match next_wake(&self.schedule) {
                Some(wake) if wake <= now => self.deliver_due(now),
                Some(wake) => {
                    let timeout = (wake - now).min(MAX_SLEEP);
                    let res = select! {
                        recv(self.work_queue) -> msg => Some(msg),
                        default(timeout) => None,
                    };
                    match res {
                        Some(Ok(msg)) => self.handle_msg(msg),
                        Some(Err(channel::RecvError)) => self.disconnected(),
                        None => (), // restart loop
                    }
                }
                None => {
                    // nothing is armed, so wait until something is
                    match self.work_queue.recv() {
                        Ok(msg) => self.handle_msg(msg),
                        Err(channel::RecvError) => self.disconnected(),
                    }
                }
            }
        }
        tracing::debug!(
            registered = self.slots.len(),
            pending = self.schedule.len(),
            "Wakeup thread stopped"
        );
    }

    fn disconnected(&mut self) {
        tracing::debug!("All wakeup refs dropped, stopping wakeup thread");
        self.running = false;
    }

    fn handle_msg(&mut self, msg: WakeupMsg) {
        tracing::trace!(?msg, "Wakeup thread received message");
        match msg {
            WakeupMsg::Stop => self.running = false,
            WakeupMsg::Register {
                id,
                context,
                handler,
            } => {
                let slot = Slot {
                    context,
                    handler,
                    pending: None,
                };
                self.slots.insert(id, slot);
            }
            WakeupMsg::Arm {
                id,
                deadline,
                leeway,
                tag,
            } => match self.slots.get_mut(&id) {
                Some(slot) => {
                    if let Some(key) = slot.pending.take() {
                        self.schedule.remove(&key);
                    }
                    let key = (deadline, self.next_seq);
                    self.next_seq += 1;
                    slot.pending = Some(key);
                    self.schedule.insert(key, Pending { id, leeway, tag });
                }
                None => tracing::warn!(%id, "Ignoring Arm for {}", WakeupError::UnknownHandle),
            },
            WakeupMsg::Disarm(id) => match self.slots.get_mut(&id) {
                Some(slot) => {
                    if let Some(key) = slot.pending.take() {
                        self.schedule.remove(&key);
                    }
                }
                None => tracing::warn!(%id, "Ignoring Disarm for {}", WakeupError::UnknownHandle),
            },
            WakeupMsg::Release(id) => match self.slots.remove(&id) {
                Some(slot) => {
                    if let Some(key) = slot.pending {
                        self.schedule.remove(&key);
                    }
                }
                None => tracing::warn!(%id, "Ignoring Release for {}", WakeupError::UnknownHandle),
            },
        }
    }

    fn deliver_due(&mut self, now: Instant) {
        while let Some(entry) = self.schedule.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((deadline, _), pending) = entry.remove_entry();
            match self.slots.get_mut(&pending.id) {
                Some(slot) => {
                    slot.pending = None;
                    let handler = slot.handler.clone();
                    let tag = pending.tag;
                    tracing::trace!(id = %pending.id, tag, late = ?(now - deadline), "Delivering wakeup");
                    slot.context.submit(Box::new(move || handler(deadline, tag)));
                }
                None => unreachable!("Released handles are removed from the schedule"),
            }
        }
    }
}

/// The time at which the driver should wake up next
///
/// This is the latest deadline that is still inside every earlier window,
/// or `None` if nothing is armed.
/// A window whose end is not representable as an [Instant] is treated as open ended.
fn next_wake(schedule: &BTreeMap<ScheduleKey, Pending>) -> Option<Instant> {
    let mut limit: Option<Instant> = None;
    let mut wake: Option<Instant> = None;
    for (&(deadline, _), pending) in schedule.iter() {
        if matches!(limit, Some(l) if deadline > l) {
            break;
        }
        if let Some(upper) = deadline.checked_add(pending.leeway) {
            limit = Some(limit.map_or(upper, |l| l.min(upper)));
        }
        wake = Some(deadline);
    }
    wake
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkQueue;
    use std::sync::Mutex;

    fn schedule_of(entries: &[(Instant, Duration)]) -> BTreeMap<ScheduleKey, Pending> {
        entries
            .iter()
            .enumerate()
            .map(|(i, &(deadline, leeway))| {
                let pending = Pending {
                    id: Uuid::new_v4(),
                    leeway,
                    tag: i as u64,
                };
                ((deadline, i as u64), pending)
            })
            .collect()
    }

    #[test]
    fn wake_time_coalesces_overlapping_windows() {
        let base = Instant::now();
        let ms = Duration::from_millis;

        assert_eq!(next_wake(&schedule_of(&[])), None);
        // a lone entry fires at its deadline
        let lone = schedule_of(&[(base + ms(100), ms(5))]);
        assert_eq!(next_wake(&lone), Some(base + ms(100)));
        // the second deadline lies inside the first window, so both go together
        let overlapping = schedule_of(&[(base + ms(100), ms(10)), (base + ms(105), ms(50))]);
        assert_eq!(next_wake(&overlapping), Some(base + ms(105)));
        // the third one is outside the first window
        let chain = schedule_of(&[
            (base + ms(100), ms(10)),
            (base + ms(108), ms(50)),
            (base + ms(115), ms(50)),
        ]);
        assert_eq!(next_wake(&chain), Some(base + ms(108)));
        // without leeway nothing is merged
        let exact = schedule_of(&[(base + ms(100), ms(0)), (base + ms(101), ms(0))]);
        assert_eq!(next_wake(&exact), Some(base + ms(100)));
    }

    /// A deadline far out, but still representable
    fn far_deadline(base: Instant) -> Instant {
        [i64::MAX as u64 / 2, 1 << 40, 1 << 32]
            .iter()
            .find_map(|&secs| base.checked_add(Duration::from_secs(secs)))
            .expect("some far deadline")
    }

    #[test]
    fn wake_time_with_unbounded_window() {
        let base = Instant::now();
        let far = far_deadline(base);
        assert_eq!(next_wake(&schedule_of(&[(far, Duration::MAX)])), Some(far));
        let mixed = schedule_of(&[
            (base, Duration::MAX),
            (base + Duration::from_millis(10), Duration::ZERO),
        ]);
        assert_eq!(next_wake(&mixed), Some(base + Duration::from_millis(10)));
    }

    #[test]
    fn far_deadline_does_not_stall_other_handles() {
        let wakeup_thread = WakeupThread::new().expect("wakeup thread");
        let wakeup = wakeup_thread.wakeup_ref();
        let queue = Arc::new(WorkQueue::serial().expect("queue"));
        let (s, r) = channel::unbounded();
        let far = wakeup
            .register(queue.clone(), Arc::new(|_, _| ()))
            .expect("register");
        let near = wakeup
            .register(queue, Arc::new(move |_, tag| s.send(tag).unwrap()))
            .expect("register");

        wakeup.arm(&far, far_deadline(Instant::now()), Duration::MAX, 0);
        // let the driver compute its wake time with only the far deadline pending
        thread::sleep(Duration::from_millis(20));
        for tag in 1..=3 {
            wakeup.arm(
                &near,
                Instant::now() + Duration::from_millis(10),
                Duration::from_millis(1),
                tag,
            );
            assert_eq!(r.recv_timeout(Duration::from_secs(5)), Ok(tag));
        }

        wakeup.release(far);
        wakeup.release(near);
        wakeup_thread
            .shutdown()
            .expect("Wakeup thread didn't shutdown properly!");
    }

    #[test]
    fn delivers_once_per_arm() {
        let wakeup_thread = WakeupThread::new().expect("wakeup thread");
        let wakeup = wakeup_thread.wakeup_ref();
        let queue = Arc::new(WorkQueue::serial().expect("queue"));
        let (s, r) = channel::unbounded();
        let handle = wakeup
            .register(queue, Arc::new(move |deadline, _| s.send(deadline).unwrap()))
            .expect("register");

        let deadline = Instant::now() + Duration::from_millis(20);
        wakeup.arm(&handle, deadline, Duration::from_millis(1), 0);
        assert_eq!(r.recv_timeout(Duration::from_secs(5)), Ok(deadline));
        assert!(Instant::now() >= deadline);
        // not rearmed, so there must not be another delivery
        assert!(r.recv_timeout(Duration::from_millis(100)).is_err());

        wakeup.release(handle);
        wakeup_thread
            .shutdown()
            .expect("Wakeup thread didn't shutdown properly!");
    }

    #[test]
    fn rearm_replaces_pending_wakeup() {
        let wakeup_thread = WakeupThread::new().expect("wakeup thread");
        let wakeup = wakeup_thread.wakeup_ref();
        let queue = Arc::new(WorkQueue::serial().expect("queue"));
        let (s, r) = channel::unbounded();
        let handle = wakeup
            .register(queue, Arc::new(move |deadline, _| s.send(deadline).unwrap()))
            .expect("register");

        let first = Instant::now() + Duration::from_millis(200);
        let second = Instant::now() + Duration::from_millis(20);
        wakeup.arm(&handle, first, Duration::ZERO, 0);
        wakeup.arm(&handle, second, Duration::ZERO, 1);
        assert_eq!(r.recv_timeout(Duration::from_secs(5)), Ok(second));
        assert!(r.recv_timeout(Duration::from_millis(400)).is_err());

        wakeup.release(handle);
        wakeup_thread
            .shutdown()
            .expect("Wakeup thread didn't shutdown properly!");
    }

    #[test]
    fn disarm_and_release_drop_pending_wakeups() {
        let wakeup_thread = WakeupThread::new().expect("wakeup thread");
        let wakeup = wakeup_thread.wakeup_ref();
        let queue = Arc::new(WorkQueue::serial().expect("queue"));
        let fired: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let fired = fired.clone();
            let handle = wakeup
                .register(
                    queue.clone(),
                    Arc::new(move |_, _| *fired.lock().unwrap() += 1),
                )
                .expect("register");
            wakeup.arm(
                &handle,
                Instant::now() + Duration::from_millis(30),
                Duration::ZERO,
                0,
            );
            handles.push(handle);
        }
        wakeup.disarm(&handles[0]);
        let released = handles.pop().expect("two handles");
        wakeup.release(released);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(*fired.lock().unwrap(), 0);

        for handle in handles {
            wakeup.release(handle);
        }
        wakeup_thread
            .shutdown()
            .expect("Wakeup thread didn't shutdown properly!");
    }

    #[test]
    fn many_handles_fire_in_deadline_order() {
        let num = 20usize;
        let wakeup_thread = WakeupThread::new().expect("wakeup thread");
        let wakeup = wakeup_thread.wakeup_ref();
        let queue = Arc::new(WorkQueue::serial().expect("queue"));
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let mut handles = Vec::with_capacity(num);
        for i in (0..num).rev() {
            let order = order.clone();
            let handle = wakeup
                .register(queue.clone(), Arc::new(move |_, _| order.lock().unwrap().push(i)))
                .expect("register");
            // 10ms apart with no leeway, so the order is fully determined
            let deadline = start + Duration::from_millis(10 * (i as u64 + 1));
            wakeup.arm(&handle, deadline, Duration::ZERO, i as u64);
            handles.push(handle);
        }
        thread::sleep(Duration::from_millis(10 * num as u64 + 200));
        assert_eq!(*order.lock().unwrap(), (0..num).collect::<Vec<_>>());

        for handle in handles {
            wakeup.release(handle);
        }
        wakeup_thread
            .shutdown()
            .expect("Wakeup thread didn't shutdown properly!");
    }

    #[test]
    fn register_fails_after_shutdown() {
        let wakeup_thread = WakeupThread::new().expect("wakeup thread");
        let wakeup = wakeup_thread.wakeup_ref();
        wakeup_thread
            .shutdown()
            .expect("Wakeup thread didn't shutdown properly!");
        let queue = Arc::new(WorkQueue::serial().expect("queue"));
        let res = wakeup.register(queue, Arc::new(|_, _| ()));
        assert_eq!(res, Err(WakeupError::Disconnected));
    }
}
