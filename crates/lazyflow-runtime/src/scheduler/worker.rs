use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;

use super::{Mode, SchedulerShared, TRACING_TARGET, Task};
use crate::request::{Request, enter_worker};

/// Main loop of worker `index`.
pub(super) fn run(shared: Arc<SchedulerShared>, index: usize) {
    enter_worker(index);
    tracing::trace!(target: TRACING_TARGET, worker = index, "worker started");

    while shared.is_running() {
        let mut worked = false;

        while let Some(task) = next_resumed(&shared, index) {
            shared.counters.resumed.fetch_add(1, Ordering::Relaxed);
            task.poll();
            worked = true;
        }

        if let Some(request) = next_request(&shared, !worked) {
            start(&shared, index, request);
            continue;
        }
        if worked {
            continue;
        }

        park(&shared, index);
    }
    tracing::trace!(target: TRACING_TARGET, worker = index, "worker stopped");
}

fn next_resumed(shared: &SchedulerShared, index: usize) -> Option<Arc<Task>> {
    if !shared.is_running() {
        return None;
    }
    shared.workers[index].resumed.lock().pop_front()
}

/// Pops the next claimable request. Fresh work is only taken when the
/// worker has nothing else to do.
fn next_request(shared: &SchedulerShared, allow_fresh: bool) -> Option<Request> {
    let mut queues = shared.queues.lock();
    if matches!(queues.mode, Mode::Suspended | Mode::Stopped) {
        return None;
    }
    while let Some(request) = queues.continuation.pop() {
        if request.try_claim() {
            return Some(request);
        }
    }
    if allow_fresh {
        while let Some(request) = queues.fresh.pop() {
            if request.try_claim() {
                return Some(request);
            }
        }
    }
    None
}

fn start(shared: &Arc<SchedulerShared>, index: usize, request: Request) {
    shared.counters.started.fetch_add(1, Ordering::Relaxed);
    let future = request.clone().execute().boxed();
    let task = Task::new(request, index, future, Arc::downgrade(shared));
    task.request().set_driver(Arc::downgrade(&task));
    shared.register_task(&task);
    task.poll();
}

/// Marks the worker idle and sleeps until new work arrives.
fn park(shared: &SchedulerShared, index: usize) {
    {
        let mut queues = shared.queues.lock();
        let has_work = match queues.mode {
            Mode::Running | Mode::Holding => {
                queues.continuation.len() > 0 || queues.fresh.len() > 0
            }
            Mode::Suspended | Mode::Stopped => false,
        };
        if has_work || !shared.workers[index].resumed.lock().is_empty() {
            return;
        }
        if !queues.free.contains(&index) {
            queues.free.push(index);
        }
        shared.idle.notify_all();
    }
    shared.workers[index].wait();
    shared.queues.lock().free.retain(|&free| free != index);
}
