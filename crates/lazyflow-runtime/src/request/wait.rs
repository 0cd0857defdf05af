use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use lazyflow_core::{Buffer, Result};

use super::{Begin, Request};

/// Future returned by [`Request::wait`].
///
/// Awaited from inside an operator, a pending request is executed inline on
/// the waiting task instead of going through the queue. Otherwise the
/// waiter is woken when the request completes; a waiter with a higher
/// level than the request raises the request's level to its own.
///
/// Dropping the future withdraws the waiter. A request left without live
/// waiters may then be canceled.
#[must_use = "futures do nothing unless awaited"]
pub struct Wait {
    request: Request,
    waiter: Option<Request>,
    stage: Stage,
}

enum Stage {
    Start,
    Inline { future: BoxFuture<'static, ()>, waiter: u64 },
    Waiting { waiter: u64 },
    Done,
}

impl Wait {
    pub(super) fn new(request: Request, waiter: Option<Request>) -> Self {
        Self {
            request,
            waiter,
            stage: Stage::Start,
        }
    }
}

impl Future for Wait {
    type Output = Result<Arc<Buffer>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.stage, Stage::Done) {
                Stage::Start => {
                    if let Some(waiter) = &this.waiter {
                        waiter.burst_deferred_except(&this.request);
                    }
                    match this.request.begin_wait(this.waiter.as_ref(), cx.waker()) {
                        Begin::Done(outcome) => return Poll::Ready(outcome.into_result()),
                        Begin::Inline(waiter) => {
                            let future = this.request.clone().execute().boxed();
                            this.stage = Stage::Inline { future, waiter };
                        }
                        Begin::Waiting(waiter) => {
                            this.stage = Stage::Waiting { waiter };
                            return Poll::Pending;
                        }
                    }
                }
                Stage::Inline { mut future, waiter } => {
                    return match future.as_mut().poll(cx) {
                        Poll::Ready(()) => {
                            this.request.remove_waiter(waiter);
                            Poll::Ready(this.request.result())
                        }
                        Poll::Pending => {
                            this.stage = Stage::Inline { future, waiter };
                            Poll::Pending
                        }
                    };
                }
                Stage::Waiting { waiter } => {
                    return match this.request.poll_waiter(waiter, cx.waker()) {
                        Some(outcome) => Poll::Ready(outcome.into_result()),
                        None => {
                            this.stage = Stage::Waiting { waiter };
                            Poll::Pending
                        }
                    };
                }
                Stage::Done => return Poll::Ready(this.request.result()),
            }
        }
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Inline { future, waiter } => {
                self.request.remove_waiter(waiter);
                drop(future);
            }
            Stage::Waiting { waiter } => self.request.remove_waiter(waiter),
            Stage::Start | Stage::Done => {}
        }
    }
}
