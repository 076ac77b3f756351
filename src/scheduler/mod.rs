//! # Keyed Job Scheduler
//!
//! Worker-thread pool behind the engine's async paths. Three lanes:
//!
//! - **Read**: lookups.
//! - **Write**: inserts and removes.
//! - **Reclaim**: region flushes and garbage collection, on dedicated
//!   threads so a burst of writes cannot starve the machinery that produces
//!   clean regions (and with it, bound worst-case insert latency).
//!
//! ## Ordering
//!
//! Every job carries a 64-bit key. Within a lane, jobs with the same key
//! land on the same worker queue (`key % queues`) and each queue is drained
//! by exactly one thread, so same-key jobs run in submission order and never
//! concurrently. Distinct keys spread across queues and run in parallel.
//! The driver routes all mutations of one cache key through the write lane
//! with the key's hash, which is what makes per-key program order hold
//! end to end.
//!
//! ## Backpressure and shutdown
//!
//! `enqueue` never blocks; the driver enforces its parcel-memory and
//! concurrent-insert caps before calling in. On shutdown the scheduler stops
//! accepting work (`ShuttingDown`), lets the workers drain what is queued
//! (bounded by a deadline), then joins them. Jobs must not panic; a panic
//! kills its worker queue.
//!
//! There is no cancellation. A queued job either runs or the process exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLane {
    Read,
    Write,
    Reclaim,
}

/// Worker-thread counts per lane.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub read_workers: usize,
    pub write_workers: usize,
    pub reclaim_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            read_workers: crate::config::DEFAULT_READ_WORKERS,
            write_workers: crate::config::DEFAULT_WRITE_WORKERS,
            reclaim_workers: crate::config::DEFAULT_RECLAIM_WORKERS,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.read_workers == 0 || self.write_workers == 0 || self.reclaim_workers == 0 {
            return Err(Error::invalid_argument(
                "every scheduler lane needs at least one worker",
            ));
        }
        Ok(())
    }
}

struct WorkerQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
}

impl WorkerQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        })
    }
}

struct Shared {
    read: Vec<Arc<WorkerQueue>>,
    write: Vec<Arc<WorkerQueue>>,
    reclaim: Vec<Arc<WorkerQueue>>,
    shutting_down: Arc<AtomicBool>,
    /// Queued + running jobs across all lanes; guards `drain`.
    pending: Mutex<u64>,
    idle: Condvar,
}

impl Shared {
    fn queues(&self, lane: JobLane) -> &[Arc<WorkerQueue>] {
        match lane {
            JobLane::Read => &self.read,
            JobLane::Write => &self.write,
            JobLane::Reclaim => &self.reclaim,
        }
    }

    fn job_done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            read: (0..config.read_workers).map(|_| WorkerQueue::new()).collect(),
            write: (0..config.write_workers).map(|_| WorkerQueue::new()).collect(),
            reclaim: (0..config.reclaim_workers)
                .map(|_| WorkerQueue::new())
                .collect(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut workers = Vec::new();
        for (lane, name) in [
            (JobLane::Read, "read"),
            (JobLane::Write, "write"),
            (JobLane::Reclaim, "reclaim"),
        ] {
            for (i, queue) in shared.queues(lane).iter().enumerate() {
                let queue = Arc::clone(queue);
                let shared = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name(format!("navy-{name}-{i}"))
                    .spawn(move || worker_loop(queue, shared))
                    .map_err(|e| Error::invalid_argument(format!("spawn worker: {e}")))?;
                workers.push(handle);
            }
        }

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Flag observed by long waits inside jobs (clean-pool waits in the
    /// block cache) so they bail out instead of stalling shutdown.
    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.shutting_down)
    }

    /// Queues `job` on `lane`. Jobs sharing `key` within a lane run in
    /// submission order, never concurrently.
    pub(crate) fn enqueue(&self, lane: JobLane, key: u64, job: Job) -> Result<()> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        *self.shared.pending.lock() += 1;

        let queues = self.shared.queues(lane);
        let queue = &queues[(key % queues.len() as u64) as usize];
        queue.jobs.lock().push_back(job);
        queue.available.notify_one();
        Ok(())
    }

    /// Blocks until every queued job (including jobs enqueued by jobs) has
    /// completed.
    pub fn drain(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Stops accepting work, drains what is queued (bounded by `deadline`),
    /// and joins the workers. Callable from a worker thread (a job dropping
    /// the last engine handle): the drain and the self-join are skipped
    /// there, and the remaining workers wind down on their own.
    pub fn shutdown(&self, deadline: Duration) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("scheduler shutting down");

        let current = std::thread::current().id();
        let on_worker = self
            .workers
            .lock()
            .iter()
            .any(|handle| handle.thread().id() == current);

        if !on_worker {
            let mut pending = self.shared.pending.lock();
            let mut remaining = deadline;
            while *pending > 0 {
                let start = std::time::Instant::now();
                if self
                    .shared
                    .idle
                    .wait_for(&mut pending, remaining)
                    .timed_out()
                {
                    warn!(pending = *pending, "shutdown drain deadline exceeded");
                    break;
                }
                remaining = remaining.saturating_sub(start.elapsed());
            }
        }

        // Wake every worker so it observes the flag and exits once its queue
        // is empty.
        for lane in [JobLane::Read, JobLane::Write, JobLane::Reclaim] {
            for queue in self.shared.queues(lane) {
                queue.available.notify_all();
            }
        }

        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown(crate::config::DEFAULT_SHUTDOWN_DRAIN_TIMEOUT);
    }
}

fn worker_loop(queue: Arc<WorkerQueue>, shared: Arc<Shared>) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                if shared.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                queue.available.wait(&mut jobs);
            }
        };
        job();
        shared.job_done();
    }
}

/// One-shot completion slot for the synchronous entry points (`lookup`,
/// `remove`): the caller blocks on `wait` while the worker publishes the
/// outcome with `complete`.
pub(crate) struct Completion<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, value: T) {
        let mut slot = self.slot.lock();
        *slot = Some(value);
        self.ready.notify_all();
    }

    pub(crate) fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.ready.wait(&mut slot);
        }
    }
}
