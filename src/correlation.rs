//! Request/response correlation
//!
//! Every outbound Call is registered here before its bytes reach the
//! transport, so a response racing back on another task can never slip
//! through unmatched. Waiting is per-request and non-blocking to other
//! requests; a request that never gets answered resolves into a
//! synthetic `GenericError` when its timeout elapses. A waiter that
//! disappears without consuming its slot withdraws the registration on
//! drop.
//!
//! Resolving an id that is no longer pending is not an error at this
//! layer: the caller offers the response to the relay table next, and
//! only counts it as a late-response anomaly when both miss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::wire::envelope::{ErrorEnvelope, RequestEnvelope, ResponseEnvelope};
use crate::wire::ids::RequestId;
use crate::wire::result::ResultCode;
use crate::shared::cancel::CancelToken;

// ── TrackedReply ───────────────────────────────────────────────

/// What eventually answers a pending request.
#[derive(Debug)]
pub enum TrackedReply {
    Response(ResponseEnvelope),
    Error(ErrorEnvelope),
}

/// Outcome of waiting on a pending request.
#[derive(Debug)]
pub enum WaitOutcome {
    Response(ResponseEnvelope),
    Error(ErrorEnvelope),
    /// No reply within the request's timeout.
    TimedOut,
    /// The caller's cancellation token fired first.
    Cancelled,
}

// ── RequestTracker ─────────────────────────────────────────────

struct PendingEntry {
    action: String,
    sender: oneshot::Sender<TrackedReply>,
    registered_at: Instant,
    /// Matches the entry to the guard that registered it.
    token: u64,
}

/// Distinguishes registrations that reuse a request id, so a stale
/// guard never evicts a successor entry.
static NEXT_GUARD_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Withdraws the registration when the waiter disappears before
/// consuming it.
struct PendingGuard {
    id: RequestId,
    token: u64,
    table: Weak<DashMap<RequestId, PendingEntry>>,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        if table
            .remove_if(&self.id, |_, entry| entry.token == self.token)
            .is_some()
        {
            debug!(request_id = %self.id, "waiter dropped, registration withdrawn");
        }
    }
}

/// Handle to one registered request. Consumed by
/// [`RequestTracker::wait`]; dropping it unconsumed withdraws the
/// registration.
pub struct PendingCall {
    id: RequestId,
    receiver: oneshot::Receiver<TrackedReply>,
    guard: PendingGuard,
}

impl PendingCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

/// A request id is already in flight.
#[derive(Debug, thiserror::Error)]
#[error("request id {0} is already awaiting a response")]
pub struct DuplicateRequestId(pub RequestId);

/// Concurrent table of requests awaiting their responses.
#[derive(Default)]
pub struct RequestTracker {
    pending: Arc<DashMap<RequestId, PendingEntry>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before it is sent.
    ///
    /// Ordering matters: registration must complete before the bytes
    /// leave, otherwise an immediate response could arrive unmatched.
    pub fn register(&self, envelope: &RequestEnvelope) -> Result<PendingCall, DuplicateRequestId> {
        use dashmap::mapref::entry::Entry;

        let (sender, receiver) = oneshot::channel();
        let token = NEXT_GUARD_TOKEN.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(envelope.request_id.clone()) {
            Entry::Occupied(_) => Err(DuplicateRequestId(envelope.request_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    action: envelope.action.clone(),
                    sender,
                    registered_at: Instant::now(),
                    token,
                });
                Ok(PendingCall {
                    id: envelope.request_id.clone(),
                    receiver,
                    guard: PendingGuard {
                        id: envelope.request_id.clone(),
                        token,
                        table: Arc::downgrade(&self.pending),
                        armed: true,
                    },
                })
            }
        }
    }

    /// Suspend until the request is answered, times out, or is
    /// cancelled. Whatever happens, the entry is gone afterwards, even
    /// when this future is dropped mid-wait.
    pub async fn wait(
        &self,
        pending: PendingCall,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> WaitOutcome {
        let PendingCall { id, receiver, mut guard } = pending;

        let outcome = tokio::select! {
            reply = receiver => match reply {
                Ok(TrackedReply::Response(envelope)) => WaitOutcome::Response(envelope),
                Ok(TrackedReply::Error(envelope)) => WaitOutcome::Error(envelope),
                // Entry was removed without an answer (e.g. flushed)
                Err(_) => WaitOutcome::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => {
                if let Some((_, entry)) = self.pending.remove(&id) {
                    metrics::counter!("ocpp_requests_timed_out_total", "action" => entry.action.clone())
                        .increment(1);
                    warn!(request_id = %id, action = %entry.action,
                        "request timed out after {:?}", timeout);
                }
                WaitOutcome::TimedOut
            }
            _ = cancel.cancelled() => {
                self.pending.remove(&id);
                debug!(request_id = %id, "request cancelled by caller");
                WaitOutcome::Cancelled
            }
        };
        // Every arm leaves the table without this entry.
        guard.disarm();
        outcome
    }

    /// Hand a response to its waiter.
    ///
    /// Gives the envelope back when nothing is pending under its id, so
    /// the caller can try back-relaying it instead.
    pub fn resolve(&self, envelope: ResponseEnvelope) -> Result<(), ResponseEnvelope> {
        match self.pending.remove(&envelope.request_id) {
            Some((id, entry)) => {
                let mut envelope = envelope;
                envelope.action = entry.action.clone();
                metrics::histogram!("ocpp_request_runtime_seconds", "action" => entry.action)
                    .record(entry.registered_at.elapsed().as_secs_f64());
                if entry.sender.send(TrackedReply::Response(envelope)).is_err() {
                    // Waiter already gave up; resolving twice stays a no-op
                    debug!(request_id = %id, "response arrived after the waiter left");
                }
                Ok(())
            }
            None => Err(envelope),
        }
    }

    /// Hand an error to its waiter. Same contract as [`resolve`](Self::resolve).
    pub fn fail(&self, envelope: ErrorEnvelope) -> Result<(), ErrorEnvelope> {
        match self.pending.remove(&envelope.request_id) {
            Some((id, entry)) => {
                metrics::histogram!("ocpp_request_runtime_seconds", "action" => entry.action)
                    .record(entry.registered_at.elapsed().as_secs_f64());
                if entry.sender.send(TrackedReply::Error(envelope)).is_err() {
                    debug!(request_id = %id, "error arrived after the waiter left");
                }
                Ok(())
            }
            None => Err(envelope),
        }
    }

    /// Drop a registration without answering it.
    pub fn abandon(&self, id: &RequestId) {
        self.pending.remove(id);
    }

    /// Fail every pending request, e.g. when the node shuts down.
    pub fn flush_all(&self, reason: &str) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((id, entry)) = self.pending.remove(&id) {
                let envelope =
                    ErrorEnvelope::new(id, ResultCode::NetworkError, reason.to_string());
                let _ = entry.sender.send(TrackedReply::Error(envelope));
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::envelope::Payload;
    use crate::wire::ids::NodeId;
    use crate::wire::path::Destination;
    use crate::wire::result::RpcResult;

    fn request(action: &str) -> RequestEnvelope {
        RequestEnvelope::call(action, Payload::empty(), Destination::Node(NodeId::csms()))
    }

    #[tokio::test]
    async fn resolve_releases_waiter() {
        let tracker = RequestTracker::new();
        let envelope = request("Heartbeat");
        let pending = tracker.register(&envelope).unwrap();

        let response = ResponseEnvelope {
            request_id: envelope.request_id.clone(),
            action: String::new(),
            result: RpcResult::ok(),
            payload: Payload::empty(),
            timestamp: chrono::Utc::now(),
            signatures: Vec::new(),
            destination: None,
            path: Default::default(),
        };
        tracker.resolve(response).unwrap();

        match tracker
            .wait(pending, Duration::from_secs(1), &CancelToken::new())
            .await
        {
            WaitOutcome::Response(got) => {
                assert_eq!(got.request_id, envelope.request_id);
                // action recovered from the pending entry
                assert_eq!(got.action, "Heartbeat");
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn timeout_empties_the_table() {
        let tracker = RequestTracker::new();
        let envelope = request("Reset");
        let pending = tracker.register(&envelope).unwrap();

        let outcome = tracker
            .wait(pending, Duration::from_millis(5), &CancelToken::new())
            .await;
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn late_response_is_handed_back() {
        let tracker = RequestTracker::new();
        let response = ResponseEnvelope {
            request_id: RequestId::new("nobody-waits"),
            action: String::new(),
            result: RpcResult::ok(),
            payload: Payload::empty(),
            timestamp: chrono::Utc::now(),
            signatures: Vec::new(),
            destination: None,
            path: Default::default(),
        };
        let back = tracker.resolve(response).unwrap_err();
        assert_eq!(back.request_id, RequestId::new("nobody-waits"));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let tracker = RequestTracker::new();
        let mut first = request("Heartbeat");
        first.request_id = RequestId::new("same");
        let mut second = request("Heartbeat");
        second.request_id = RequestId::new("same");

        let _pending = tracker.register(&first).unwrap();
        assert!(tracker.register(&second).is_err());
    }

    #[tokio::test]
    async fn dropped_pending_call_withdraws_the_registration() {
        let tracker = RequestTracker::new();
        let envelope = request("Heartbeat");
        let pending = tracker.register(&envelope).unwrap();
        assert_eq!(tracker.outstanding(), 1);

        drop(pending);
        assert_eq!(tracker.outstanding(), 0);

        // Whatever answers now is handed back as late.
        let response = ResponseEnvelope {
            request_id: envelope.request_id.clone(),
            action: String::new(),
            result: RpcResult::ok(),
            payload: Payload::empty(),
            timestamp: chrono::Utc::now(),
            signatures: Vec::new(),
            destination: None,
            path: Default::default(),
        };
        assert!(tracker.resolve(response).is_err());
    }

    #[tokio::test]
    async fn dropping_the_wait_future_cleans_the_table() {
        let tracker = RequestTracker::new();
        let envelope = request("Reset");
        let pending = tracker.register(&envelope).unwrap();

        // A caller racing the wait against something faster drops the
        // future mid-select.
        let raced = tokio::time::timeout(
            Duration::from_millis(5),
            tracker.wait(pending, Duration::from_secs(30), &envelope.cancel),
        )
        .await;
        assert!(raced.is_err());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn stale_guard_leaves_a_reused_id_alone() {
        let tracker = RequestTracker::new();
        let mut first = request("Heartbeat");
        first.request_id = RequestId::new("same");
        let stale = tracker.register(&first).unwrap();
        tracker.abandon(&first.request_id);

        let mut second = request("Heartbeat");
        second.request_id = RequestId::new("same");
        let _live = tracker.register(&second).unwrap();

        drop(stale);
        assert_eq!(tracker.outstanding(), 1);
    }

    #[tokio::test]
    async fn cancel_token_interrupts_wait() {
        let tracker = RequestTracker::new();
        let envelope = request("Reset");
        let pending = tracker.register(&envelope).unwrap();

        let cancel = envelope.cancel.clone();
        cancel.cancel();

        let outcome = tracker
            .wait(pending, Duration::from_secs(30), &cancel)
            .await;
        assert!(matches!(outcome, WaitOutcome::Cancelled));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn flush_fails_everyone() {
        let tracker = RequestTracker::new();
        let a = tracker.register(&request("Heartbeat")).unwrap();
        let b = tracker.register(&request("Reset")).unwrap();

        tracker.flush_all("node shutting down");

        for pending in [a, b] {
            match tracker
                .wait(pending, Duration::from_secs(1), &CancelToken::new())
                .await
            {
                WaitOutcome::Error(envelope) => {
                    assert_eq!(envelope.code, ResultCode::NetworkError)
                }
                other => panic!("expected error, got {other:?}"),
            }
        }
    }
}
