use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use lazyflow_core::{Buffer, DType, Error, Result};
use pin_project_lite::pin_project;

use super::{Request, RequestOutcome, TRACING_TARGET, context};
use crate::operator::ExecuteContext;

impl Request {
    /// Drives a claimed request to its final state.
    pub(crate) async fn execute(self) {
        let mut guard = RunGuard {
            request: Some(self.clone()),
        };
        let result = InRequest {
            request: self.clone(),
            inner: AssertUnwindSafe(self.perform()).catch_unwind(),
        }
        .await;
        guard.disarm();

        let outcome = match result {
            None => RequestOutcome::Canceled,
            Some(Ok(Ok(data))) => RequestOutcome::Finished(Arc::new(data)),
            // A canceled dependency fails this request; only its own
            // cancellation makes it Canceled.
            Some(Ok(Err(err))) if err.is_canceled() && self.is_canceled() => {
                RequestOutcome::Canceled
            }
            Some(Ok(Err(err))) => RequestOutcome::Failed(err),
            Some(Err(panic)) => {
                let message = panic_message(&*panic);
                tracing::error!(
                    target: TRACING_TARGET,
                    request = %self.id(),
                    panic = %message,
                    "operator panicked"
                );
                let operator = self
                    .target()
                    .map(|t| t.qualified_name())
                    .unwrap_or_default();
                RequestOutcome::Failed(
                    Error::operator(format!("panicked: {message}")).in_operator(operator, self.roi()),
                )
            }
        };
        if !matches!(outcome, RequestOutcome::Canceled) {
            self.burst_deferred();
        }
        self.finalize(outcome);
    }

    async fn perform(&self) -> Result<Buffer> {
        let target = self
            .target()
            .ok_or_else(|| Error::Internal(format!("request {} has nothing to compute", self.id())))?;
        let node = target.owner()?;
        let operator = node.leaf()?;
        let graph = node.graph()?;
        let dtype: DType = target
            .meta()
            .dtype()
            .ok_or_else(|| Error::SlotNotReady(target.qualified_name()))?;
        let roi = self.roi();

        let mut destination = match self.take_destination() {
            Some(buffer) if buffer.dtype() != dtype => {
                return Err(Error::DTypeMismatch {
                    expected: dtype,
                    found: buffer.dtype(),
                });
            }
            Some(buffer) => buffer,
            None => Buffer::zeros(dtype, &roi.shape()),
        };

        tracing::trace!(
            target: TRACING_TARGET,
            request = %self.id(),
            operator = %node.name(),
            roi = %roi,
            "executing"
        );
        let ctx = ExecuteContext::new(node.clone(), graph, self.clone());
        if let Err(err) = operator.execute(&ctx, target, roi, &mut destination).await {
            if !matches!(err, Error::Execution { .. } | Error::Canceled | Error::Shutdown) {
                tracing::error!(
                    target: TRACING_TARGET,
                    request = %self.id(),
                    operator = %node.name(),
                    roi = %roi,
                    error = %err,
                    "operator failed"
                );
            }
            return Err(err.in_operator(node.name(), roi));
        }
        Ok(destination)
    }
}

/// Puts an interrupted request back in the queue, or cancels it.
struct RunGuard {
    request: Option<Request>,
}

impl RunGuard {
    fn disarm(&mut self) {
        self.request = None;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            request.abandon();
        }
    }
}

pin_project! {
    /// Polls `inner` with `request` as the current request. Resolves to
    /// `None` once the request was canceled.
    struct InRequest<F> {
        request: Request,
        #[pin]
        inner: F,
    }
}

impl<F: Future> Future for InRequest<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.request.is_canceled() {
            return Poll::Ready(None);
        }
        let _scope = context::enter_request(Some(this.request.clone()));
        this.inner.poll(cx).map(Some)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
