//! Forwarding decision types
//!
//! What the decision engine hands the transport. The engine never
//! writes to the network itself: a decision says forward, reject or
//! drop, carries the bytes to relay or the response to send back, and
//! for forwards a one-shot sent-logger the transport fires once the
//! relay send has actually happened.

use serde::{Deserialize, Serialize};

use crate::routing::codec::AnyMessage;
use crate::wire::envelope::{ErrorEnvelope, Payload};
use crate::wire::ids::{NodeId, RequestId};
use crate::wire::result::RpcResult;
use crate::wire::signature::Signature;

// ── DefaultPolicy ──────────────────────────────────────────────

/// What happens to a request no filter decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultPolicy {
    #[default]
    Forward,
    Reject,
}

// ── DecisionKind ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    /// Relay to the next hop.
    Forward,
    /// Answer the origin with a rejection; nothing is relayed.
    Reject,
    /// Nothing is relayed and nothing is sent back.
    Drop,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Forward => "forward",
            DecisionKind::Reject => "reject",
            DecisionKind::Drop => "drop",
        }
    }
}

// ── Rejection ──────────────────────────────────────────────────

/// How a rejected request is answered.
#[derive(Debug, Clone)]
pub enum Rejection {
    /// A CallResult whose payload carries the message type's own
    /// Rejected-equivalent status.
    Response(Payload),
    /// A CallError.
    Error(ErrorEnvelope),
}

// ── ForwardingDecision ─────────────────────────────────────────

/// Transport callback fired once the relay send completed, with the
/// peer that took the frame, or `None` when the send failed.
pub type SentLogger = Box<dyn FnOnce(Option<&NodeId>) + Send>;

/// Outcome of running one request through the decision engine.
pub struct ForwardingDecision {
    pub action: String,
    pub request_id: RequestId,
    pub kind: DecisionKind,
    /// The typed request, when its action was registered and parsed.
    pub request: Option<AnyMessage>,
    /// Replacement request produced by a filter.
    pub new_request: Option<AnyMessage>,
    /// Replacement payload, serialized at decision time so the
    /// transport relays new bytes without re-deriving them.
    pub new_payload: Option<Payload>,
    /// Fresh signatures for a rewritten payload; the originals cannot
    /// survive a rewrite.
    pub new_signatures: Vec<Signature>,
    /// How to answer the origin, for rejections. Synthesized even for
    /// drops, though the transport then sends nothing.
    pub rejection: Option<Rejection>,
    pub result: RpcResult,
    pub reason: Option<String>,
    sent_logger: Option<SentLogger>,
}

impl ForwardingDecision {
    pub fn forward(action: impl Into<String>, request_id: RequestId) -> Self {
        Self {
            action: action.into(),
            request_id,
            kind: DecisionKind::Forward,
            request: None,
            new_request: None,
            new_payload: None,
            new_signatures: Vec::new(),
            rejection: None,
            result: RpcResult::ok(),
            reason: None,
            sent_logger: None,
        }
    }

    pub fn reject(
        action: impl Into<String>,
        request_id: RequestId,
        result: RpcResult,
        rejection: Rejection,
    ) -> Self {
        Self {
            action: action.into(),
            request_id,
            kind: DecisionKind::Reject,
            request: None,
            new_request: None,
            new_payload: None,
            new_signatures: Vec::new(),
            rejection: Some(rejection),
            result,
            reason: None,
            sent_logger: None,
        }
    }

    pub fn is_forward(&self) -> bool {
        self.kind == DecisionKind::Forward
    }

    pub fn is_reject(&self) -> bool {
        self.kind == DecisionKind::Reject
    }

    pub fn is_drop(&self) -> bool {
        self.kind == DecisionKind::Drop
    }

    /// True when a filter rewrote the request.
    pub fn is_rewritten(&self) -> bool {
        self.new_payload.is_some()
    }

    pub fn with_sent_logger(mut self, logger: SentLogger) -> Self {
        self.sent_logger = Some(logger);
        self
    }

    /// Called by the transport after the relay send finished, with the
    /// hop the frame went to. At most one invocation has any effect.
    pub fn notify_sent(&mut self, hop: Option<&NodeId>) {
        if let Some(logger) = self.sent_logger.take() {
            logger(hop);
        }
    }
}

impl std::fmt::Debug for ForwardingDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingDecision")
            .field("action", &self.action)
            .field("request_id", &self.request_id)
            .field("kind", &self.kind)
            .field("rewritten", &self.is_rewritten())
            .field("result", &self.result)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn sent_logger_fires_once_with_the_hop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let mut decision = ForwardingDecision::forward("Heartbeat", RequestId::new("r1"))
            .with_sent_logger(Box::new(move |hop| {
                assert_eq!(hop.map(NodeId::as_str), Some("NN-2"));
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let hop = NodeId::new("NN-2");
        decision.notify_sent(Some(&hop));
        decision.notify_sent(Some(&hop));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_policy_parses_from_config_names() {
        let policy: DefaultPolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(policy, DefaultPolicy::Reject);
    }
}
