//! Per-thread execution context.
//!
//! Workers record which request is being polled so that requests created
//! inside an operator become its children, and which task hosts it so that
//! cancellation can wake the right task.

use std::cell::{Cell, RefCell};
use std::sync::Weak;

use super::Request;
use crate::scheduler::Task;

thread_local! {
    static CURRENT_REQUEST: RefCell<Option<Request>> = const { RefCell::new(None) };
    static CURRENT_TASK: RefCell<Option<Weak<Task>>> = const { RefCell::new(None) };
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Request currently executing on this thread.
pub(crate) fn current_request() -> Option<Request> {
    CURRENT_REQUEST.with(|current| current.borrow().clone())
}

/// Task currently polled on this thread.
pub(crate) fn current_task() -> Option<Weak<Task>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

/// Returns true on a worker thread.
pub(crate) fn in_worker() -> bool {
    WORKER_INDEX.with(Cell::get).is_some()
}

/// Marks the calling thread as worker `index` for its lifetime.
pub(crate) fn enter_worker(index: usize) {
    WORKER_INDEX.with(|worker| worker.set(Some(index)));
}

/// Restores the previous current request on drop.
pub(crate) struct RequestScope {
    previous: Option<Request>,
}

/// Makes `request` the current request until the scope is dropped.
pub(crate) fn enter_request(request: Option<Request>) -> RequestScope {
    let previous = CURRENT_REQUEST.with(|current| current.replace(request));
    RequestScope { previous }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let replaced = CURRENT_REQUEST.with(|current| current.replace(previous));
        drop(replaced);
    }
}

/// Restores the previous current task on drop.
pub(crate) struct TaskScope {
    previous: Option<Weak<Task>>,
}

/// Makes `task` the current task until the scope is dropped.
pub(crate) fn enter_task(task: Weak<Task>) -> TaskScope {
    let previous = CURRENT_TASK.with(|current| current.replace(Some(task)));
    TaskScope { previous }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|current| current.replace(previous));
    }
}
