use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{ClientError, RequestError, Result};

type Slot = oneshot::Sender<std::result::Result<Value, RequestError>>;

/// Request id → pending result slot.
///
/// Each id goes through `register` and then exactly one of `resolve` or
/// `fail_all`. After `fail_all` the table is closed for good.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    inner: Mutex<TableInner>,
}

#[derive(Debug, Default)]
struct TableInner {
    pending: HashMap<u64, Slot>,
    closed: bool,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh slot for `request_id` and hand back its receiving side.
    pub fn register(&self, request_id: u64) -> Result<PendingResponse> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ClientError::SessionClosed);
        }
        if inner.pending.contains_key(&request_id) {
            return Err(ClientError::DuplicateRequestId(request_id));
        }

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(request_id, tx);
        trace!(request_id, pending = inner.pending.len(), "request registered");
        Ok(PendingResponse { request_id, rx })
    }

    /// Complete and remove the slot for `request_id`.
    ///
    /// A waiter that already dropped its handle still counts as matched.
    pub fn resolve(
        &self,
        request_id: u64,
        outcome: std::result::Result<Value, RequestError>,
    ) -> Result<()> {
        let slot = self
            .lock()
            .pending
            .remove(&request_id)
            .ok_or(ClientError::UnmatchedResponse(request_id))?;

        if slot.send(outcome).is_err() {
            debug!(request_id, "response arrived after caller stopped waiting");
        }
        Ok(())
    }

    /// Drain every slot, completing each with `error`, and close the table.
    ///
    /// Returns the number of requests that were failed.
    pub fn fail_all(&self, error: RequestError) -> usize {
        let drained: Vec<(u64, Slot)> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };

        let count = drained.len();
        for (request_id, slot) in drained {
            trace!(request_id, "failing pending request");
            let _ = slot.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// In-flight ids in ascending order.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for the eventual response to one request.
///
/// Resolves to the processor's JSON result, [`ClientError::Rejected`] when the
/// processor answered with an error, or [`ClientError::Disconnected`] when the
/// session ended first.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: u64,
    rx: oneshot::Receiver<std::result::Result<Value, RequestError>>,
}

impl PendingResponse {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let request_id = this.request_id;
        Pin::new(&mut this.rx).poll(cx).map(|received| match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into_client_error(request_id)),
            Err(_) => Err(ClientError::Disconnected(
                "correlation table dropped".to_string(),
            )),
        })
    }
}
