//! Priority worker pool executing requests.
//!
//! Every worker owns a resume queue of woken tasks it hosts. Shared between
//! workers are two priority queues: one for requests created by other
//! requests (continuations) and one for requests created from outside the
//! graph (fresh). A worker drains its resume queue first, then takes a
//! continuation, and only takes fresh work when it had nothing else to do.
//! Inside each queue the highest level wins; levels grow along request
//! trees and whenever a child completes, so deep and nearly finished work
//! goes first.

mod queue;
mod task;
mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use lazyflow_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use self::queue::TaskQueue;
pub(crate) use self::task::Task;
use crate::request::{Request, RequestOutcome, RequestState, in_worker};

/// Tracing target for scheduler events.
const TRACING_TARGET: &str = "lazyflow_runtime::scheduler";

/// Callback delivering a request outcome to its subscribers and waiters.
pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

/// Counters describing the work done by a graph's workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Requests handed to the queues.
    pub submitted: u64,
    /// Requests started by a worker.
    pub started: u64,
    /// Tasks resumed after waiting.
    pub resumed: u64,
    pub finished: u64,
    pub failed: u64,
    pub canceled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Running,
    /// Root requests are held back while nested work drains.
    Holding,
    /// Nothing runs; new requests and deliveries are held back.
    Suspended,
    Stopped,
}

struct Queues {
    continuation: TaskQueue<Request>,
    fresh: TaskQueue<Request>,
    free: Vec<usize>,
    mode: Mode,
    held: VecDeque<Request>,
    deferred: Vec<Delivery>,
}

impl Queues {
    /// Queues the request and returns an idle worker to wake, if any.
    fn enqueue(&mut self, request: Request) -> Option<usize> {
        let level = request.level();
        if request.has_parent() {
            self.continuation.push(level, request);
        } else {
            self.fresh.push(level, request);
        }
        self.free.pop()
    }
}

/// Wake-up signal of one worker plus its resume queue.
struct WorkerSignal {
    resumed: Mutex<VecDeque<Arc<Task>>>,
    flag: Mutex<bool>,
    cond: Condvar,
}

impl WorkerSignal {
    fn new() -> Self {
        Self {
            resumed: Mutex::new(VecDeque::new()),
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
        *flag = false;
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    started: AtomicU64,
    resumed: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
}

/// State shared by the workers and every request of a graph.
pub(crate) struct SchedulerShared {
    queues: Mutex<Queues>,
    idle: Condvar,
    workers: Vec<WorkerSignal>,
    running: AtomicBool,
    tasks: Mutex<Vec<Weak<Task>>>,
    counters: Counters,
}

impl SchedulerShared {
    fn new(num_workers: usize) -> Self {
        Self {
            queues: Mutex::new(Queues {
                continuation: TaskQueue::new(),
                fresh: TaskQueue::new(),
                free: Vec::new(),
                mode: Mode::Running,
                held: VecDeque::new(),
                deferred: Vec::new(),
            }),
            idle: Condvar::new(),
            workers: (0..num_workers).map(|_| WorkerSignal::new()).collect(),
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queues a launched request.
    pub(crate) fn submit(&self, request: Request) {
        let mut queues = self.queues.lock();
        match queues.mode {
            Mode::Stopped => {
                drop(queues);
                request.finalize(RequestOutcome::Failed(Error::Shutdown));
                return;
            }
            Mode::Suspended => {
                queues.held.push_back(request);
                return;
            }
            Mode::Holding if !request.has_parent() => {
                queues.held.push_back(request);
                return;
            }
            Mode::Running | Mode::Holding => {}
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let worker = queues.enqueue(request);
        drop(queues);
        if let Some(worker) = worker {
            self.workers[worker].notify();
        }
    }

    /// Queues a request again after its level changed. The stale entry is
    /// skipped when popped because the request is no longer pending then.
    pub(crate) fn requeue(&self, request: Request) {
        let mut queues = self.queues.lock();
        let accepted = match queues.mode {
            Mode::Running => true,
            Mode::Holding => request.has_parent(),
            Mode::Suspended | Mode::Stopped => false,
        };
        if !accepted || !request.is_pending() {
            return;
        }
        let worker = queues.enqueue(request);
        drop(queues);
        if let Some(worker) = worker {
            self.workers[worker].notify();
        }
    }

    /// Puts a woken task on the resume queue of its worker.
    pub(crate) fn resume_task(&self, task: Arc<Task>) {
        if !self.is_running() {
            return;
        }
        let signal = &self.workers[task.worker()];
        signal.resumed.lock().push_back(task);
        signal.notify();
    }

    /// Runs `delivery` now, or after [`SchedulerShared::resume`] while the
    /// graph is suspended.
    pub(crate) fn deliver(&self, delivery: Delivery) {
        let mut queues = self.queues.lock();
        if queues.mode == Mode::Suspended {
            queues.deferred.push(delivery);
            return;
        }
        drop(queues);
        delivery();
    }

    pub(crate) fn record_outcome(&self, state: RequestState) {
        let counter = match state {
            RequestState::Finished => &self.counters.finished,
            RequestState::Failed => &self.counters.failed,
            RequestState::Canceled => &self.counters.canceled,
            RequestState::Pending | RequestState::InProgress => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            started: c.started.load(Ordering::Relaxed),
            resumed: c.resumed.load(Ordering::Relaxed),
            finished: c.finished.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            canceled: c.canceled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.queues.lock().mode == Mode::Suspended
    }

    /// Stops taking new root work, lets every started request finish and
    /// waits until all workers are idle.
    ///
    /// Root requests arriving meanwhile are held and run on
    /// [`SchedulerShared::resume`].
    pub(crate) fn suspend(&self) -> Result<()> {
        if in_worker() {
            return Err(Error::Internal(
                "a graph cannot be suspended from one of its own workers".into(),
            ));
        }
        let (nested, wake) = {
            let mut queues = self.queues.lock();
            match queues.mode {
                Mode::Running => {}
                Mode::Holding | Mode::Suspended => return Ok(()),
                Mode::Stopped => return Err(Error::Shutdown),
            }
            queues.mode = Mode::Holding;

            let mut drained = queues.continuation.drain();
            drained.extend(queues.fresh.drain());
            let mut nested = Vec::new();
            for request in drained {
                if !request.is_pending() {
                    continue;
                }
                if request.has_parent() {
                    nested.push(request);
                } else {
                    queues.held.push_back(request);
                }
            }
            nested.sort_by_key(|r| std::cmp::Reverse(r.level()));
            let wake: Vec<usize> = nested
                .iter()
                .filter_map(|r| queues.enqueue(r.clone()))
                .collect();
            (nested, wake)
        };
        for worker in wake {
            self.workers[worker].notify();
        }

        tracing::debug!(
            target: TRACING_TARGET,
            nested = nested.len(),
            "draining nested requests before suspending"
        );
        for request in &nested {
            if let Err(err) = futures::executor::block_on(request.wait()) {
                tracing::warn!(
                    target: TRACING_TARGET,
                    request = %request.id(),
                    error = %err,
                    "nested request did not finish while suspending"
                );
            }
        }

        let mut queues = self.queues.lock();
        queues.mode = Mode::Suspended;
        while queues.free.len() < self.workers.len() && self.is_running() {
            self.idle.wait(&mut queues);
        }
        tracing::debug!(target: TRACING_TARGET, held = queues.held.len(), "scheduler suspended");
        Ok(())
    }

    /// Leaves the suspended state, delivering held outcomes and starting
    /// held requests.
    pub(crate) fn resume(&self) {
        let (held, deferred) = {
            let mut queues = self.queues.lock();
            if !matches!(queues.mode, Mode::Holding | Mode::Suspended) {
                return;
            }
            queues.mode = Mode::Running;
            (
                std::mem::take(&mut queues.held),
                std::mem::take(&mut queues.deferred),
            )
        };
        tracing::debug!(target: TRACING_TARGET, held = held.len(), "scheduler resumed");
        for delivery in deferred {
            delivery();
        }
        for request in held {
            if request.is_pending() {
                self.submit(request);
            }
        }
    }

    fn register_task(&self, task: &Arc<Task>) {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= 256 {
            tasks.retain(|t| t.strong_count() > 0);
        }
        tasks.push(Arc::downgrade(task));
    }
}

/// Owner of the worker threads of one graph.
pub(crate) struct Scheduler {
    shared: Arc<SchedulerShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns `num_workers` worker threads.
    pub(crate) fn start(num_workers: usize) -> Result<Self> {
        let shared = Arc::new(SchedulerShared::new(num_workers));
        let mut handles = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("lazyflow-worker-{index}"))
                .spawn(move || worker::run(worker_shared, index))
                .map_err(|err| Error::Internal(format!("failed to spawn worker {index}: {err}")))?;
            handles.push(handle);
        }
        tracing::debug!(target: TRACING_TARGET, num_workers, "scheduler started");
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }

    /// Cancels queued work, joins the workers and fails every request that
    /// can no longer run.
    pub(crate) fn stop(&self) {
        let (pending, deferred) = {
            let mut queues = self.shared.queues.lock();
            if queues.mode == Mode::Stopped {
                return;
            }
            queues.mode = Mode::Stopped;
            let mut pending = queues.continuation.drain();
            pending.extend(queues.fresh.drain());
            pending.extend(queues.held.drain(..));
            (pending, std::mem::take(&mut queues.deferred))
        };
        self.shared.running.store(false, Ordering::Release);
        for signal in &self.shared.workers {
            signal.notify();
        }
        self.shared.idle.notify_all();

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        for delivery in deferred {
            delivery();
        }
        for request in pending {
            request.terminate();
        }
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks.iter().filter_map(Weak::upgrade) {
            task.abort();
        }
        for signal in &self.shared.workers {
            signal.resumed.lock().clear();
        }
        tracing::debug!(target: TRACING_TARGET, "scheduler stopped");
    }
}
