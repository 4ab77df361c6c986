//! Forwarding decision engine
//!
//! Runs one relayed request through parse, signature check, filter
//! chain and default policy, and returns a [`ForwardingDecision`] for
//! the transport to act on. This component never writes to the network.
//!
//! Filter arbitration: every registered filter for the action runs in
//! registration order. A rewrite swaps the request all later filters
//! see and the chain continues; the first reject or drop is final and
//! ends the chain. Forwarding therefore requires every filter to let
//! the message pass. With no filters registered the process-wide
//! default policy decides. A filter that panics abstains.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::events::{Event, EventBus, RequestFilteredEvent, RequestForwardedEvent, RequestReceivedEvent};
use crate::routing::codec::AnyMessage;
use crate::routing::decision::{DecisionKind, DefaultPolicy, ForwardingDecision, Rejection};
use crate::routing::filter::FilterVerdict;
use crate::routing::registry::{MessageRegistry, RequestContext};
use crate::wire::envelope::{ErrorEnvelope, Payload, RequestEnvelope};
use crate::wire::ids::{NodeId, RequestId};
use crate::wire::result::{ResultCode, RpcResult};
use crate::wire::signature::{Signature, SignatureKeyring, VerifyMode};

pub struct ForwardingEngine {
    node_id: NodeId,
    registry: Arc<MessageRegistry>,
    events: EventBus,
    default_policy: DefaultPolicy,
    keyring: Arc<SignatureKeyring>,
    verify_mode: VerifyMode,
    /// When set, rewritten payloads are re-signed with this key.
    resign_key: Option<String>,
}

impl ForwardingEngine {
    pub fn new(node_id: NodeId, registry: Arc<MessageRegistry>, events: EventBus) -> Self {
        Self {
            node_id,
            registry,
            events,
            default_policy: DefaultPolicy::default(),
            keyring: Arc::new(SignatureKeyring::new()),
            verify_mode: VerifyMode::Off,
            resign_key: None,
        }
    }

    pub fn with_default_policy(mut self, policy: DefaultPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_signature_policy(
        mut self,
        keyring: Arc<SignatureKeyring>,
        mode: VerifyMode,
        resign_key: Option<String>,
    ) -> Self {
        self.keyring = keyring;
        self.verify_mode = mode;
        self.resign_key = resign_key;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Decide what to do with a request passing through this node.
    pub async fn decide(&self, origin: &NodeId, envelope: &RequestEnvelope) -> ForwardingDecision {
        let action = envelope.action.clone();
        let request_id = envelope.request_id.clone();

        // 1. Parse. Failure is terminal for this message: reject with a
        //    descriptive error and run nothing else.
        let request = match self.registry.decode(&action, &envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                let code = e.result_code();
                metrics::counter!("ocpp_messages_rejected_total", "action" => action.clone())
                    .increment(1);
                debug!(action = %action, request_id = %request_id, "parse failed: {e}");
                return ForwardingDecision::reject(
                    action,
                    request_id.clone(),
                    RpcResult::error(code, e.to_string()),
                    Rejection::Error(
                        ErrorEnvelope::new(request_id, code, e.to_string()).answering(envelope),
                    ),
                );
            }
        };

        // Signature check, when configured. Binary payloads cannot
        // carry a signature array and are skipped.
        if self.verify_mode != VerifyMode::Off {
            if let Some(json) = envelope.payload.as_json() {
                if let Err(e) = self.keyring.verify(
                    &action,
                    &request_id,
                    json,
                    &envelope.signatures,
                    self.verify_mode,
                ) {
                    metrics::counter!("ocpp_messages_rejected_total", "action" => action.clone())
                        .increment(1);
                    warn!(action = %action, request_id = %request_id, "signature check failed: {e}");
                    return ForwardingDecision::reject(
                        action,
                        request_id.clone(),
                        RpcResult::error(ResultCode::SignatureError, e.to_string()),
                        Rejection::Error(
                            ErrorEnvelope::new(request_id, ResultCode::SignatureError, e.to_string())
                                .answering(envelope),
                        ),
                    );
                }
            }
        }

        // 2. Received-event, best-effort.
        self.events.publish(Event::RequestReceived(RequestReceivedEvent {
            peer_id: origin.to_string(),
            action: action.clone(),
            request_id: request_id.to_string(),
            tracking_id: envelope.tracking.to_string(),
            timestamp: Utc::now(),
        }));

        // 3. Filter chain.
        let filters = self.registry.filters(&action);
        let ctx = RequestContext {
            origin: origin.clone(),
            envelope: Arc::new(envelope.clone()),
        };

        let mut current = request.clone();
        let mut replacement: Option<AnyMessage> = None;
        let mut veto: Option<(DecisionKind, String, Option<Payload>)> = None;

        for filter in &filters {
            let fut = filter(ctx.clone(), current.clone());
            match AssertUnwindSafe(fut).catch_unwind().await {
                Err(_) => {
                    warn!(action = %action, "filter panicked; treating as abstained");
                    continue;
                }
                Ok(FilterVerdict::Forward) => continue,
                Ok(FilterVerdict::Replace(new_request)) => {
                    current = new_request.clone();
                    replacement = Some(new_request);
                }
                Ok(FilterVerdict::Reject { reason, payload }) => {
                    veto = Some((DecisionKind::Reject, reason, payload));
                    break;
                }
                Ok(FilterVerdict::Drop { reason }) => {
                    veto = Some((DecisionKind::Drop, reason, None));
                    break;
                }
            }
        }

        // 4. Default policy: only consulted when no filter is
        //    registered at all. Filters that all said forward ARE the
        //    decision.
        let verdict = match veto {
            Some(veto) => Some(veto),
            None if filters.is_empty() && self.default_policy == DefaultPolicy::Reject => Some((
                DecisionKind::Reject,
                "rejected by default policy".to_string(),
                None,
            )),
            None => None,
        };

        let mut decision = match verdict {
            None => {
                let mut decision = ForwardingDecision::forward(action.clone(), request_id.clone());
                decision.request = Some(request);
                decision.new_request = replacement;
                decision
            }
            Some((kind, reason, payload)) => {
                let metric = match kind {
                    DecisionKind::Drop => "ocpp_messages_dropped_total",
                    _ => "ocpp_messages_rejected_total",
                };
                metrics::counter!(metric, "action" => action.clone()).increment(1);

                // Synthesize the rejection response when the filter did
                // not supply one: the message type's own Rejected status
                // if it has one, a CallError otherwise.
                let rejection = match payload {
                    Some(payload) => Rejection::Response(payload),
                    None => self.synthesize_rejection(&current, envelope, &reason),
                };

                let mut decision = ForwardingDecision::reject(
                    action.clone(),
                    request_id.clone(),
                    RpcResult::error(ResultCode::Filtered, reason.clone()),
                    rejection,
                );
                decision.kind = kind;
                decision.request = Some(request);
                decision.reason = Some(reason);
                decision
            }
        };

        // 5. Rewrite serialization: give the transport relay-ready
        //    bytes for a replaced request.
        if decision.is_forward() {
            if let Some(new_request) = decision.new_request.clone() {
                match self.registry.encode(&new_request) {
                    Ok(payload) => {
                        decision.new_signatures = self.resign(&action, &request_id, &payload);
                        decision.new_payload = Some(payload);
                    }
                    Err(e) => {
                        warn!(action = %action, "rewrite serialization failed: {e}");
                        decision = ForwardingDecision::reject(
                            action.clone(),
                            request_id.clone(),
                            RpcResult::error(ResultCode::InternalError, e.to_string()),
                            Rejection::Error(
                                ErrorEnvelope::new(
                                    request_id.clone(),
                                    ResultCode::InternalError,
                                    e.to_string(),
                                )
                                .answering(envelope),
                            ),
                        );
                    }
                }
            }
        }

        // 6. Filtered-event with the final decision attached.
        self.events.publish(Event::RequestFiltered(RequestFilteredEvent {
            action: action.clone(),
            request_id: request_id.to_string(),
            tracking_id: envelope.tracking.to_string(),
            decision: decision.kind.as_str().to_string(),
            reason: decision.reason.clone(),
            rewritten: decision.is_rewritten(),
            timestamp: Utc::now(),
        }));

        // 7. Sent-logger, forwards only. The transport fires it after
        //    the relay send finishes, naming the hop that took the
        //    frame. The hop is only known at send time.
        if decision.is_forward() {
            let events = self.events.clone();
            let action = action.clone();
            let request_id = request_id.to_string();
            let tracking_id = envelope.tracking.to_string();
            decision = decision.with_sent_logger(Box::new(move |hop| {
                if hop.is_some() {
                    metrics::counter!("ocpp_messages_forwarded_total", "action" => action.clone())
                        .increment(1);
                }
                events.publish(Event::RequestForwarded(RequestForwardedEvent {
                    action,
                    request_id,
                    tracking_id,
                    next_hop: hop.map(|h| h.to_string()),
                    success: hop.is_some(),
                    timestamp: Utc::now(),
                }));
            }));
        }

        decision
    }

    fn synthesize_rejection(
        &self,
        request: &AnyMessage,
        envelope: &RequestEnvelope,
        reason: &str,
    ) -> Rejection {
        let typed = self
            .registry
            .codec(request.action())
            .and_then(|codec| codec.rejected_response(request, reason));
        match typed {
            Some(payload) => Rejection::Response(payload),
            None => Rejection::Error(
                ErrorEnvelope::filtered(envelope.request_id.clone(), reason.to_string())
                    .answering(envelope),
            ),
        }
    }

    fn resign(&self, action: &str, request_id: &RequestId, payload: &Payload) -> Vec<Signature> {
        let Some(key_id) = &self.resign_key else {
            return Vec::new();
        };
        let Some(json) = payload.as_json() else {
            return Vec::new();
        };
        match self.keyring.sign(action, request_id, json, key_id) {
            Ok(signature) => vec![signature],
            Err(e) => {
                warn!("re-signing rewritten payload failed: {e}");
                Vec::new()
            }
        }
    }
}
