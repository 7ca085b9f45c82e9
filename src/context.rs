//! Execution contexts on which timer actions are run.
//!
//! An [ExecutionContext](ExecutionContext) is an opaque FIFO queue of jobs.
//! Timers never run their actions on the wakeup thread itself, but always hand them
//! to the context they were created with.
//!
//! The [WorkQueue](WorkQueue) provided here is a simple pool of worker threads
//! sharing a single [crossbeam_channel](crossbeam_channel) queue.

use crossbeam_channel as channel;
use std::{
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    thread,
};

/// A unit of work submitted to an execution context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO task queue that runs submitted jobs on some worker
///
/// Implementations must not run a job on the thread that submitted it,
/// as the wakeup thread submits from within its own event loop.
pub trait ExecutionContext: Send + Sync {
    /// Enqueue `job` to be run eventually
    fn submit(&self, job: Job);
}

enum WorkMsg {
    Run(Job),
    Stop,
}

/// A pool of worker threads serving a shared FIFO queue
///
/// Jobs are dequeued in submission order. With more than one worker, jobs
/// from the queue may still run in parallel.
///
/// A job that panics is caught and logged, and the worker continues with the next job.
pub struct WorkQueue {
    queue: channel::Sender<WorkMsg>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkQueue {
    /// Create a new queue served by `num_workers` threads
    ///
    /// The threads will be called `"timer-worker-{i}"`.
    pub fn new(num_workers: usize) -> io::Result<WorkQueue> {
        let (s, r) = channel::unbounded();
        let mut workers = Vec::with_capacity(num_workers.max(1));
        for i in 0..num_workers.max(1) {
            let r = r.clone();
            let handle = thread::Builder::new()
                .name(format!("timer-worker-{}", i))
                .spawn(move || worker_loop(r))?;
            workers.push(handle);
        }
        Ok(WorkQueue { queue: s, workers })
    }

    /// Create a queue with exactly one worker, which runs jobs strictly one after another
    pub fn serial() -> io::Result<WorkQueue> {
        Self::new(1)
    }

    /// The number of worker threads serving this queue
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop all workers after the jobs already enqueued and wait for them to exit
    pub fn shutdown(self) -> thread::Result<()> {
        for _ in 0..self.workers.len() {
            self.queue
                .send(WorkMsg::Stop)
                .unwrap_or_else(|e| tracing::warn!("Could not send Stop msg: {:?}", e.0.kind()));
        }
        let mut res = Ok(());
        for w in self.workers {
            if let Err(e) = w.join() {
                tracing::error!("Worker thread panicked!");
                res = Err(e);
            }
        }
        res
    }
}

impl ExecutionContext for WorkQueue {
    fn submit(&self, job: Job) {
        self.queue
            .send(WorkMsg::Run(job))
            .unwrap_or_else(|_| tracing::warn!("Could not submit job, all workers have stopped"));
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<WorkQueue workers={}>", self.workers.len())
    }
}

impl WorkMsg {
    fn kind(&self) -> &'static str {
        match self {
            WorkMsg::Run(_) => "Run",
            WorkMsg::Stop => "Stop",
        }
    }
}

fn worker_loop(queue: channel::Receiver<WorkMsg>) {
    // a disconnected queue means every handle is gone, so there is nothing left to do
    while let Ok(msg) = queue.recv() {
        match msg {
            WorkMsg::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(
                        worker = thread::current().name().unwrap_or("<unnamed>"),
                        "Job panicked, continuing with the next one"
                    );
                }
            }
            WorkMsg::Stop => break,
        }
    }
}

/// The process-wide context used by timers that are not given one explicitly
///
/// It is created on first use with one worker per available core and lives for the
/// rest of the process. Fails if the workers can not be spawned; the next call tries again.
pub fn default_context() -> io::Result<Arc<dyn ExecutionContext>> {
    static DEFAULT: OnceLock<Arc<WorkQueue>> = OnceLock::new();
    if let Some(queue) = DEFAULT.get() {
        return Ok(queue.clone());
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    tracing::debug!(workers, "Starting default execution context");
    let started = Arc::new(WorkQueue::new(workers)?);
    // if another caller won the race, `started` is dropped and its workers exit
    Ok(DEFAULT.get_or_init(|| started).clone())
}
