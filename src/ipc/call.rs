//! Caller-side handle for an in-flight channel call.
//!
//! A [`CallHandle`] is a future resolving to the call's outcome, a stream of
//! progress notifications, and a cancel switch. The protocol side keeps the
//! matching [`CallSink`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{IpcError, Result};

/// Cancels one call. Cloneable and idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    action: Arc<dyn Fn() + Send + Sync>,
}

impl CancelHandle {
    pub fn new<F: Fn() + Send + Sync + 'static>(action: F) -> Self {
        Self {
            action: Arc::new(action),
        }
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn cancel(&self) {
        (self.action)()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CancelHandle")
    }
}

/// Protocol side of a call: settles the caller's [`CallHandle`].
#[derive(Debug)]
pub(crate) struct CallSink {
    result: oneshot::Sender<Result<Value>>,
    progress: mpsc::UnboundedSender<Value>,
}

impl CallSink {
    /// Deliver a progress notification. Ignored if the caller went away.
    pub(crate) fn progress(&self, data: Value) {
        let _ = self.progress.send(data);
    }

    /// Settle the call. Dropping the sink closes the progress stream.
    pub(crate) fn resolve(self, outcome: Result<Value>) {
        let _ = self.result.send(outcome);
    }
}

/// Create a linked sink and handle.
pub(crate) fn pending_call(id: Option<u64>, cancel: CancelHandle) -> (CallSink, CallHandle) {
    let (result_tx, result_rx) = oneshot::channel();
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    (
        CallSink {
            result: result_tx,
            progress: progress_tx,
        },
        CallHandle {
            id,
            result: result_rx,
            progress: progress_rx,
            cancel,
        },
    )
}

/// Pending outcome of a channel call.
///
/// Await it for the result. Cancelling settles it with [`IpcError::Canceled`]
/// right away. Dropping it does not cancel the remote call.
#[derive(Debug)]
pub struct CallHandle {
    id: Option<u64>,
    result: oneshot::Receiver<Result<Value>>,
    progress: mpsc::UnboundedReceiver<Value>,
    cancel: CancelHandle,
}

impl CallHandle {
    /// A handle that is already settled with `err`.
    pub fn failed(err: IpcError) -> Self {
        let (sink, handle) = pending_call(None, CancelHandle::noop());
        sink.resolve(Err(err));
        handle
    }

    /// Request id assigned by the channel client, if the call reached one.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Cancel the call.
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// A detached cancel switch for this call.
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Next progress notification. `None` once the call has settled and all
    /// notifications were consumed.
    pub async fn next_progress(&mut self) -> Option<Value> {
        self.progress.recv().await
    }

    /// Next progress notification, if one is already queued.
    pub fn try_progress(&mut self) -> Option<Value> {
        self.progress.try_recv().ok()
    }

    /// Await the result and deserialize it.
    pub async fn typed<R: DeserializeOwned>(self) -> Result<R> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }

    pub(crate) fn split(self) -> (oneshot::Receiver<Result<Value>>, mpsc::UnboundedReceiver<Value>, CancelHandle) {
        (self.result, self.progress, self.cancel)
    }
}

impl Future for CallHandle {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.result)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(IpcError::Disposed)))
    }
}
