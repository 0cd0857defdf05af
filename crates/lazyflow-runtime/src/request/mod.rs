//! Requests: the scheduled computation of one region of one output slot.
//!
//! A request is created lazily by [`OutputSlot::get`] and starts when
//! somebody waits on it, subscribes to it or submits it. Requests created
//! while another request executes become its children: they inherit a
//! priority level one above their parent, are canceled with it and, when
//! created back to back, only the last one stays deferred so the parent can
//! run it inline when it waits.
//!
//! Life cycle: `Pending -> InProgress -> Finished | Failed | Canceled`.
//!
//! [`OutputSlot::get`]: crate::slot::OutputSlot::get

mod context;
mod run;
mod wait;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

use lazyflow_core::{Buffer, Error, Result, Roi};
use parking_lot::Mutex;
use strum::{AsRefStr, Display, IntoStaticStr};

#[cfg(test)]
pub(crate) use context::enter_request;
pub(crate) use context::{enter_task, enter_worker, in_worker};
pub use wait::Wait;

use crate::id::RequestId;
use crate::scheduler::{SchedulerShared, Task};
use crate::slot::OutputSlot;

/// Tracing target for request life-cycle events.
const TRACING_TARGET: &str = "lazyflow_runtime::request";

type Subscriber = Box<dyn FnOnce(&RequestOutcome) + Send>;
type CancelCallback = Box<dyn FnMut() -> bool + Send>;

/// Life-cycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RequestState {
    Pending,
    InProgress,
    Finished,
    Failed,
    Canceled,
}

impl RequestState {
    /// Returns true for the three final states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

/// Final result of a request, handed to every subscriber.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Finished(Arc<Buffer>),
    Failed(Error),
    Canceled,
}

impl RequestOutcome {
    pub fn state(&self) -> RequestState {
        match self {
            Self::Finished(_) => RequestState::Finished,
            Self::Failed(_) => RequestState::Failed,
            Self::Canceled => RequestState::Canceled,
        }
    }

    /// Converts into the result seen by waiters.
    pub fn into_result(self) -> Result<Arc<Buffer>> {
        match self {
            Self::Finished(data) => Ok(data),
            Self::Failed(err) => Err(err),
            Self::Canceled => Err(Error::Canceled),
        }
    }
}

/// Handle to a scheduled computation.
///
/// Cloning is cheap; clones refer to the same request.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

pub(crate) struct RequestInner {
    id: RequestId,
    target: Option<OutputSlot>,
    roi: Roi,
    scheduler: Weak<SchedulerShared>,
    canceled: AtomicBool,
    shared: Mutex<Shared>,
}

struct Shared {
    state: RequestState,
    queued: bool,
    priority: i64,
    level: i64,
    destination: Option<Buffer>,
    outcome: Option<RequestOutcome>,
    parent: Option<Weak<RequestInner>>,
    children: Vec<Request>,
    deferred: Option<Request>,
    waiters: Vec<Waiter>,
    next_waiter: u64,
    subscribers: Vec<Subscriber>,
    cancel_callbacks: Vec<CancelCallback>,
    driver: Option<Weak<Task>>,
}

/// Somebody waiting for a request.
///
/// `request` is the waiting request, absent for external waiters. A waiter
/// keeps the request alive (prevents cancellation) unless its own request
/// was canceled.
struct Waiter {
    id: u64,
    waker: Option<Waker>,
    request: Option<Weak<RequestInner>>,
}

impl Waiter {
    fn is_live(&self) -> bool {
        match &self.request {
            None => true,
            Some(request) => request
                .upgrade()
                .is_some_and(|r| !r.canceled.load(Ordering::Acquire)),
        }
    }
}

impl Shared {
    fn push_waiter(&mut self, waker: Option<Waker>, request: Option<&Request>) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.waiters.push(Waiter {
            id,
            waker,
            request: request.map(|r| Arc::downgrade(&r.inner)),
        });
        id
    }
}

/// Result of registering a waiter.
pub(crate) enum Begin {
    /// The request already has an outcome.
    Done(RequestOutcome),
    /// The caller claimed the request and must drive it inline.
    Inline(u64),
    /// The caller registered a waker.
    Waiting(u64),
}

impl Request {
    fn build(
        target: Option<OutputSlot>,
        roi: Roi,
        scheduler: Weak<SchedulerShared>,
        parent: Option<&Request>,
        outcome: Option<RequestOutcome>,
    ) -> Self {
        let level = parent.map_or(0, |p| p.level() + 1);
        let state = outcome
            .as_ref()
            .map_or(RequestState::Pending, RequestOutcome::state);
        Self {
            inner: Arc::new(RequestInner {
                id: RequestId::next(),
                target,
                roi,
                scheduler,
                canceled: AtomicBool::new(false),
                shared: Mutex::new(Shared {
                    state,
                    queued: false,
                    priority: 0,
                    level,
                    destination: None,
                    outcome,
                    parent: parent.map(|p| Arc::downgrade(&p.inner)),
                    children: Vec::new(),
                    deferred: None,
                    waiters: Vec::new(),
                    next_waiter: 0,
                    subscribers: Vec::new(),
                    cancel_callbacks: Vec::new(),
                    driver: None,
                }),
            }),
        }
    }

    /// Creates a request for `roi` of `target`.
    ///
    /// When called while another request executes on this thread, the new
    /// request becomes its child and the previously deferred sibling is
    /// launched.
    pub(crate) fn spawn(target: OutputSlot, roi: Roi, scheduler: &Arc<SchedulerShared>) -> Self {
        let parent = context::current_request().filter(|p| !p.is_canceled());
        let request = Self::build(
            Some(target),
            roi,
            Arc::downgrade(scheduler),
            parent.as_ref(),
            None,
        );
        tracing::trace!(
            target: TRACING_TARGET,
            request = %request.id(),
            parent = ?parent.as_ref().map(Request::id),
            roi = %request.roi(),
            "request created"
        );

        if let Some(parent) = parent {
            let previous = {
                let mut shared = parent.inner.shared.lock();
                shared.children.push(request.clone());
                shared.deferred.replace(request.clone())
            };
            if let Some(previous) = previous {
                previous.launch();
            }
        }
        request
    }

    /// A request that is already finished with `data`.
    pub(crate) fn ready(data: Buffer, roi: Roi) -> Self {
        Self::build(
            None,
            roi,
            Weak::new(),
            None,
            Some(RequestOutcome::Finished(Arc::new(data))),
        )
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// Region computed by the request.
    pub fn roi(&self) -> &Roi {
        &self.inner.roi
    }

    /// Output slot computed by the request; absent for literal values.
    pub fn target(&self) -> Option<&OutputSlot> {
        self.inner.target.as_ref()
    }

    pub fn state(&self) -> RequestState {
        self.inner.shared.lock().state
    }

    pub fn priority(&self) -> i64 {
        self.inner.shared.lock().priority
    }

    /// Scheduling level; higher levels run first.
    pub fn level(&self) -> i64 {
        self.inner.shared.lock().level
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RequestState::Finished
    }

    /// Outcome, once the request reached a final state.
    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.inner.shared.lock().outcome.clone()
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.inner.shared.lock().parent.is_some()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.inner.shared.lock().state == RequestState::Pending
    }

    pub(crate) fn ptr_eq(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Makes the computation write into `destination` with the given
    /// priority instead of allocating its own buffer.
    ///
    /// `destination` must have the shape of the request region. A request
    /// that already finished copies its data into `destination`.
    pub fn write_into(&self, destination: Buffer, priority: i64) -> Result<Request> {
        let expected = self.inner.roi.shape();
        if destination.shape() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                expected,
                found: destination.shape().to_vec(),
            });
        }
        if let Some(dtype) = self.inner.target.as_ref().and_then(|t| t.meta().dtype())
            && dtype != destination.dtype()
        {
            return Err(Error::DTypeMismatch {
                expected: dtype,
                found: destination.dtype(),
            });
        }

        let delta = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                RequestState::Pending => {
                    shared.destination = Some(destination);
                    priority - shared.priority
                }
                RequestState::Finished => {
                    if let Some(RequestOutcome::Finished(data)) = shared.outcome.clone() {
                        let mut destination = destination;
                        destination.assign(&data)?;
                        shared.outcome = Some(RequestOutcome::Finished(Arc::new(destination)));
                    }
                    0
                }
                state => {
                    return Err(Error::Internal(format!(
                        "request {} cannot change its destination while {state}",
                        self.id()
                    )));
                }
            }
        };
        if delta != 0 {
            self.adjust_priority(delta);
        }
        Ok(self.clone())
    }

    /// Starts the request without waiting for it.
    pub fn submit(&self) {
        self.launch();
    }

    /// Waits for the request, yielding its data.
    pub fn wait(&self) -> Wait {
        Wait::new(self.clone(), context::current_request())
    }

    /// Blocks the calling thread until the request completes.
    ///
    /// Fails on worker threads, where blocking would stall the pool.
    pub fn wait_blocking(&self) -> Result<Arc<Buffer>> {
        if context::in_worker() {
            return Err(Error::Internal(
                "wait_blocking called from a worker; await the request instead".into(),
            ));
        }
        futures::executor::block_on(self.wait())
    }

    /// Calls `callback` with the outcome once the request completes, and
    /// starts the request.
    ///
    /// Callbacks run in subscription order. A callback registered after
    /// completion runs immediately on the calling thread.
    pub fn notify(&self, callback: impl FnOnce(&RequestOutcome) + Send + 'static) {
        let mut shared = self.inner.shared.lock();
        if let Some(outcome) = shared.outcome.clone() {
            drop(shared);
            callback(&outcome);
            return;
        }
        shared.subscribers.push(Box::new(callback));
        drop(shared);
        self.launch();
    }

    /// Registers a callback consulted before the request is canceled.
    ///
    /// Returning false vetoes the cancellation.
    pub fn on_cancel(&self, callback: impl FnMut() -> bool + Send + 'static) {
        let mut shared = self.inner.shared.lock();
        if !shared.state.is_terminal() {
            shared.cancel_callbacks.push(Box::new(callback));
        }
    }

    /// Cancels the request and its children.
    ///
    /// Refused (returns false) when the request already completed, when a
    /// live waiter still needs it, or when a cancel callback vetoes.
    pub fn cancel(&self) -> bool {
        let mut callbacks = {
            let mut shared = self.inner.shared.lock();
            if shared.state.is_terminal() {
                return false;
            }
            if shared.waiters.iter().any(Waiter::is_live) {
                tracing::debug!(
                    target: TRACING_TARGET,
                    request = %self.id(),
                    "cancel refused: request has live waiters"
                );
                return false;
            }
            std::mem::take(&mut shared.cancel_callbacks)
        };

        if callbacks.iter_mut().any(|callback| !callback()) {
            tracing::debug!(target: TRACING_TARGET, request = %self.id(), "cancel vetoed");
            let mut shared = self.inner.shared.lock();
            callbacks.append(&mut shared.cancel_callbacks);
            shared.cancel_callbacks = callbacks;
            return false;
        }

        self.inner.canceled.store(true, Ordering::Release);
        let (children, driver) = {
            let mut shared = self.inner.shared.lock();
            (std::mem::take(&mut shared.children), shared.driver.take())
        };
        for child in children {
            child.cancel();
        }
        self.finalize(RequestOutcome::Canceled);
        if let Some(task) = driver.and_then(|task| task.upgrade()) {
            futures::task::ArcWake::wake_by_ref(&task);
        }
        tracing::debug!(target: TRACING_TARGET, request = %self.id(), "request canceled");
        true
    }

    /// Cancels without consulting waiters or callbacks. Used on shutdown.
    pub(crate) fn terminate(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        let children = std::mem::take(&mut self.inner.shared.lock().children);
        for child in children {
            child.terminate();
        }
        self.finalize(RequestOutcome::Canceled);
    }

    /// Shifts the level of the request and its children by `delta`.
    pub fn adjust_priority(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let (children, requeue) = {
            let mut shared = self.inner.shared.lock();
            if shared.state.is_terminal() {
                return;
            }
            shared.priority += delta;
            shared.level += delta;
            (
                shared.children.clone(),
                shared.queued && shared.state == RequestState::Pending,
            )
        };
        if requeue && let Some(scheduler) = self.inner.scheduler.upgrade() {
            scheduler.requeue(self.clone());
        }
        for child in children {
            child.adjust_priority(delta);
        }
    }

    /// Hands the request to the scheduler, once.
    pub(crate) fn launch(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != RequestState::Pending || shared.queued {
                return;
            }
            shared.queued = true;
        }
        match self.inner.scheduler.upgrade() {
            Some(scheduler) => scheduler.submit(self.clone()),
            None => self.finalize(RequestOutcome::Failed(Error::Shutdown)),
        }
    }

    /// Moves a pending request into progress. Fails if somebody else did.
    pub(crate) fn try_claim(&self) -> bool {
        let mut shared = self.inner.shared.lock();
        if shared.state == RequestState::Pending && !self.is_canceled() {
            shared.state = RequestState::InProgress;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_driver(&self, task: Weak<Task>) {
        self.inner.shared.lock().driver = Some(task);
    }

    pub(crate) fn take_destination(&self) -> Option<Buffer> {
        self.inner.shared.lock().destination.take()
    }

    /// Registers a waiter, claiming the request for inline execution when
    /// the waiter is itself a request.
    pub(crate) fn begin_wait(&self, waiter: Option<&Request>, waker: &Waker) -> Begin {
        let waiter_level = waiter.map(Request::level);
        let mut shared = self.inner.shared.lock();
        if let Some(outcome) = shared.outcome.clone() {
            return Begin::Done(outcome);
        }

        match shared.state {
            RequestState::Pending if waiter.is_some() && !self.is_canceled() => {
                shared.state = RequestState::InProgress;
                shared.driver = context::current_task();
                Begin::Inline(shared.push_waiter(None, waiter))
            }
            RequestState::Pending => {
                let id = shared.push_waiter(Some(waker.clone()), waiter);
                drop(shared);
                self.launch();
                Begin::Waiting(id)
            }
            _ => {
                let id = shared.push_waiter(Some(waker.clone()), waiter);
                let boost = waiter_level
                    .map(|level| level - shared.level)
                    .filter(|delta| *delta > 0);
                drop(shared);
                if let Some(delta) = boost {
                    tracing::trace!(
                        target: TRACING_TARGET,
                        request = %self.id(),
                        delta,
                        "priority raised by waiter"
                    );
                    self.adjust_priority(delta);
                }
                if let Some(waiter) = waiter {
                    waiter.adopt(self);
                }
                Begin::Waiting(id)
            }
        }
    }

    /// Returns the outcome, or refreshes the waker of waiter `id`.
    pub(crate) fn poll_waiter(&self, id: u64, waker: &Waker) -> Option<RequestOutcome> {
        let mut shared = self.inner.shared.lock();
        if let Some(outcome) = shared.outcome.clone() {
            shared.waiters.retain(|w| w.id != id);
            return Some(outcome);
        }
        if let Some(waiter) = shared.waiters.iter_mut().find(|w| w.id == id) {
            match &waiter.waker {
                Some(current) if current.will_wake(waker) => {}
                _ => waiter.waker = Some(waker.clone()),
            }
        }
        None
    }

    pub(crate) fn remove_waiter(&self, id: u64) {
        self.inner.shared.lock().waiters.retain(|w| w.id != id);
    }

    pub(crate) fn result(&self) -> Result<Arc<Buffer>> {
        self.outcome()
            .map(RequestOutcome::into_result)
            .unwrap_or_else(|| Err(Error::Internal(format!("request {} has no outcome", self.id()))))
    }

    /// Treats `child` as a child for cancellation and priority changes.
    fn adopt(&self, child: &Request) {
        let mut shared = self.inner.shared.lock();
        if !shared.state.is_terminal() && !shared.children.iter().any(|c| c.ptr_eq(child)) {
            shared.children.push(child.clone());
        }
    }

    /// Launches the deferred child unless it is `except`.
    pub(crate) fn burst_deferred_except(&self, except: &Request) {
        let deferred = {
            let mut shared = self.inner.shared.lock();
            match &shared.deferred {
                Some(deferred) if deferred.ptr_eq(except) => None,
                _ => shared.deferred.take(),
            }
        };
        if let Some(deferred) = deferred {
            deferred.launch();
        }
    }

    /// Launches the deferred child, if any.
    pub(crate) fn burst_deferred(&self) {
        let deferred = self.inner.shared.lock().deferred.take();
        if let Some(deferred) = deferred {
            deferred.launch();
        }
    }

    /// Gives up an in-progress request whose driver went away.
    ///
    /// With live waiters left the request goes back to the queue, otherwise
    /// it is canceled.
    pub(crate) fn abandon(&self) {
        let relaunch = {
            let mut shared = self.inner.shared.lock();
            if shared.state != RequestState::InProgress || self.is_canceled() {
                return;
            }
            let live = shared.waiters.iter().any(Waiter::is_live);
            if live {
                shared.state = RequestState::Pending;
                shared.queued = false;
                shared.driver = None;
            }
            live
        };
        if relaunch {
            tracing::trace!(target: TRACING_TARGET, request = %self.id(), "request relaunched");
            self.launch();
        } else {
            self.cancel();
        }
    }

    /// Records the outcome and notifies parent, subscribers and waiters.
    pub(crate) fn finalize(&self, outcome: RequestOutcome) {
        let (parent, waiters, subscribers) = {
            let mut shared = self.inner.shared.lock();
            if shared.state.is_terminal() {
                return;
            }
            shared.state = outcome.state();
            shared.outcome = Some(outcome.clone());
            shared.children.clear();
            shared.cancel_callbacks.clear();
            shared.driver = None;
            shared.destination = None;
            shared.deferred = None;
            (
                shared.parent.take(),
                std::mem::take(&mut shared.waiters),
                std::mem::take(&mut shared.subscribers),
            )
        };

        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            let mut shared = parent.shared.lock();
            shared.level += 1;
            shared
                .children
                .retain(|child| !Arc::ptr_eq(&child.inner, &self.inner));
        }

        match &outcome {
            RequestOutcome::Failed(err) => tracing::debug!(
                target: TRACING_TARGET,
                request = %self.id(),
                error = %err,
                "request failed"
            ),
            other => tracing::trace!(
                target: TRACING_TARGET,
                request = %self.id(),
                state = %other.state(),
                "request completed"
            ),
        }

        let state = outcome.state();
        let deliver = move || {
            let _scope = context::enter_request(None);
            for subscriber in subscribers {
                subscriber(&outcome);
            }
            for waiter in waiters {
                if let Some(waker) = waiter.waker {
                    waker.wake();
                }
            }
        };
        match self.inner.scheduler.upgrade() {
            Some(scheduler) => {
                scheduler.record_outcome(state);
                scheduler.deliver(Box::new(deliver));
            }
            None => deliver(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("roi", &self.inner.roi)
            .field("state", &shared.state)
            .field("level", &shared.level)
            .finish_non_exhaustive()
    }
}
