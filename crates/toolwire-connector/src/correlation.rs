//! Request correlation.
//!
//! Every outbound request gets an id that is unique among the requests still
//! pending on its connection. A matching response resolves exactly one
//! waiter. Timeout, cancellation and connection loss all remove the entry
//! before rejecting it, so a response arriving afterwards finds nothing to
//! resolve.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};
use toolwire_core::{RequestId, Response};

use crate::error::ConnectorError;

/// Number of expired or cancelled ids remembered for late-response accounting.
pub const LATE_WINDOW: usize = 256;

type Reply = Result<Value, ConnectorError>;

struct PendingRequest {
    method: String,
    created_at: Instant,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<RequestId, PendingRequest>,
    retired: VecDeque<RequestId>,
    retired_set: HashSet<RequestId>,
    closed: bool,
}

impl Table {
    fn retire(&mut self, id: RequestId) {
        if !self.retired_set.insert(id.clone()) {
            return;
        }
        self.retired.push_back(id);
        if self.retired.len() > LATE_WINDOW {
            if let Some(oldest) = self.retired.pop_front() {
                self.retired_set.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    abandoned: AtomicU64,
    failed: AtomicU64,
    late: AtomicU64,
    unmatched: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of a correlation engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub sent: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Waiters dropped before their request settled.
    pub abandoned: u64,
    /// Requests rejected because the connection closed.
    pub failed: u64,
    pub late_responses: u64,
    pub unmatched_responses: u64,
    pub pending: usize,
}

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Resolved a pending request.
    Matched,
    /// Answered a request that already timed out or was cancelled.
    Late,
    /// Matched nothing this connection sent recently.
    Unmatched,
    /// Arrived after the engine was closed.
    Discarded,
}

/// Pending-request table for one connection.
pub struct CorrelationEngine {
    table: Mutex<Table>,
    next_id: AtomicI64,
    counters: Counters,
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            next_id: AtomicI64::new(1),
            counters: Counters::default(),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request and return its waiter.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` once the engine is closed.
    pub fn register(
        self: &Arc<Self>,
        method: &str,
        timeout: Duration,
    ) -> Result<PendingCall, ConnectorError> {
        let (reply, rx) = oneshot::channel();
        let now = Instant::now();

        let mut table = self.table();
        if table.closed {
            return Err(ConnectorError::ConnectionClosed);
        }
        let id = loop {
            let candidate = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !table.pending.contains_key(&candidate) {
                break candidate;
            }
            tracing::warn!(request_id = %candidate, "correlation id collision, regenerating");
        };
        table.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                created_at: now,
                reply,
            },
        );
        drop(table);
        bump(&self.counters.sent);

        Ok(PendingCall {
            engine: Arc::clone(self),
            id,
            method: method.to_string(),
            timeout,
            deadline: deadline_after(now, timeout),
            rx,
            settled: false,
        })
    }

    /// Route an inbound response to its waiter.
    pub fn resolve(&self, response: Response) -> Resolution {
        let mut table = self.table();
        if table.closed {
            tracing::debug!(request_id = %response.id, "response after close discarded");
            return Resolution::Discarded;
        }

        if let Some(entry) = table.pending.remove(&response.id) {
            drop(table);
            bump(&self.counters.resolved);
            tracing::debug!(
                request_id = %response.id,
                method = %entry.method,
                elapsed_ms = entry.created_at.elapsed().as_millis(),
                "response matched"
            );
            let _ = entry.reply.send(response.outcome.map_err(ConnectorError::Rpc));
            return Resolution::Matched;
        }

        let late = table.retired_set.contains(&response.id);
        drop(table);
        if late {
            bump(&self.counters.late);
            tracing::debug!(request_id = %response.id, "discarding late response");
            Resolution::Late
        } else {
            bump(&self.counters.unmatched);
            tracing::warn!(request_id = %response.id, "response matches no pending request");
            Resolution::Unmatched
        }
    }

    fn retire(&self, id: &RequestId) -> Option<PendingRequest> {
        let mut table = self.table();
        let entry = table.pending.remove(id)?;
        table.retire(id.clone());
        Some(entry)
    }

    /// Cancel one pending request, rejecting its waiter with `Cancelled`.
    /// Returns whether the request was still pending.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let Some(entry) = self.retire(id) else {
            return false;
        };
        bump(&self.counters.cancelled);
        tracing::debug!(request_id = %id, method = %entry.method, "request cancelled");
        let _ = entry.reply.send(Err(ConnectorError::Cancelled));
        true
    }

    fn expire(&self, id: &RequestId) -> bool {
        let Some(entry) = self.retire(id) else {
            return false;
        };
        bump(&self.counters.timed_out);
        tracing::debug!(request_id = %id, method = %entry.method, "request timed out");
        true
    }

    fn abandon(&self, id: &RequestId) {
        if let Some(entry) = self.retire(id) {
            bump(&self.counters.abandoned);
            tracing::debug!(request_id = %id, method = %entry.method, "waiter dropped");
        }
    }

    /// Reject every pending request with `error` and refuse new ones until
    /// [`reopen`](Self::reopen). Returns how many requests were rejected.
    pub fn close(&self, error: &ConnectorError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table();
            table.closed = true;
            table.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(error.clone()));
        }
        self.counters
            .failed
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Accept requests again after a close.
    pub fn reopen(&self) {
        self.table().closed = false;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.table().closed
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table().pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.table().pending.contains_key(id)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EngineStats {
            sent: load(&self.counters.sent),
            resolved: load(&self.counters.resolved),
            timed_out: load(&self.counters.timed_out),
            cancelled: load(&self.counters.cancelled),
            abandoned: load(&self.counters.abandoned),
            failed: load(&self.counters.failed),
            late_responses: load(&self.counters.late),
            unmatched_responses: load(&self.counters.unmatched),
            pending: self.pending_count(),
        }
    }
}

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

/// Waiter for one registered request.
///
/// Dropping it before it settles removes the request from the table.
#[must_use = "a pending call does nothing unless waited on"]
pub struct PendingCall {
    engine: Arc<CorrelationEngine>,
    id: RequestId,
    method: String,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Reply>,
    settled: bool,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PendingCall {
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    fn timeout_error(&self) -> ConnectorError {
        ConnectorError::Timeout {
            method: self.method.clone(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Give up on the request before it was fully sent, counting it as timed
    /// out.
    pub(crate) fn expire(mut self) -> ConnectorError {
        self.settled = true;
        self.engine.expire(&self.id);
        self.timeout_error()
    }

    /// Wait for the response, the deadline, or the connection to close.
    ///
    /// # Errors
    /// Returns the peer's error object as `Rpc`, or `Timeout`, `Cancelled`
    /// or `ConnectionClosed`.
    pub async fn wait(mut self) -> Result<Value, ConnectorError> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.rx).await;
        self.settled = true;
        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ConnectorError::ConnectionClosed),
            Err(_) => {
                if self.engine.expire(&self.id) {
                    Err(self.timeout_error())
                } else {
                    // Settled between the deadline firing and the removal.
                    self.rx
                        .try_recv()
                        .unwrap_or_else(|_| Err(self.timeout_error()))
                }
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled {
            self.engine.abandon(&self.id);
        }
    }
}
