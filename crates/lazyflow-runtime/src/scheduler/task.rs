use std::sync::{Arc, Weak};
use std::task::Context;

use futures::future::BoxFuture;
use futures::task::{ArcWake, waker_ref};
use parking_lot::Mutex;

use super::SchedulerShared;
use crate::request::{Request, enter_task};

/// A root execution pinned to the worker that started it.
///
/// Waking a task puts it on its worker's resume queue; it is always polled
/// by the same worker.
pub(crate) struct Task {
    request: Request,
    worker: usize,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    scheduler: Weak<SchedulerShared>,
}

impl Task {
    pub(crate) fn new(
        request: Request,
        worker: usize,
        future: BoxFuture<'static, ()>,
        scheduler: Weak<SchedulerShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request,
            worker,
            future: Mutex::new(Some(future)),
            scheduler,
        })
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn worker(&self) -> usize {
        self.worker
    }

    /// Polls the task once. Returns true when it is done.
    pub(crate) fn poll(self: &Arc<Self>) -> bool {
        if self.request.is_canceled() {
            self.abort();
            return true;
        }
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return true;
        };
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        let _scope = enter_task(Arc::downgrade(self));
        if future.as_mut().poll(&mut cx).is_ready() {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Drops the future, withdrawing every waiter it registered.
    pub(crate) fn abort(&self) {
        let future = self.future.try_lock().and_then(|mut slot| slot.take());
        drop(future);
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Some(scheduler) = arc_self.scheduler.upgrade() {
            scheduler.resume_task(arc_self.clone());
        }
    }
}
