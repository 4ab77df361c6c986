//! Forwarding filters
//!
//! Filters inspect a typed request on its way through the node and
//! vote on it. A filter can let it pass, rewrite it, reject it with a
//! response, or drop it silently. Registration order is evaluation
//! order; a rewritten request is what every later filter sees.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::routing::codec::{AnyMessage, OcppRequest};
use crate::routing::registry::RequestContext;
use crate::wire::envelope::Payload;

// ── Typed filter decision ──────────────────────────────────────

/// What one filter wants done with a request, typed.
pub enum FilterDecision<M: OcppRequest> {
    /// Let it pass unchanged.
    Forward,
    /// Let it pass, but relay this request instead.
    Replace(M),
    /// Turn it away, optionally with a type-specific response.
    Reject {
        reason: String,
        response: Option<M::Response>,
    },
    /// Swallow it: nothing relayed, nothing answered.
    Drop { reason: String },
}

impl<M: OcppRequest> FilterDecision<M> {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
            response: None,
        }
    }

    pub fn reject_with(reason: impl Into<String>, response: M::Response) -> Self {
        Self::Reject {
            reason: reason.into(),
            response: Some(response),
        }
    }

    pub fn dropped(reason: impl Into<String>) -> Self {
        Self::Drop {
            reason: reason.into(),
        }
    }
}

// ── Erased filter ──────────────────────────────────────────────

/// Type-erased form of a filter decision.
#[derive(Debug)]
pub enum FilterVerdict {
    Forward,
    Replace(AnyMessage),
    Reject {
        reason: String,
        payload: Option<Payload>,
    },
    Drop {
        reason: String,
    },
}

pub type FilterFuture = Pin<Box<dyn Future<Output = FilterVerdict> + Send>>;

/// A registered filter, erased so the registry can hold any mix.
pub type ErasedFilter = Arc<dyn Fn(RequestContext, AnyMessage) -> FilterFuture + Send + Sync>;

/// Wrap a typed async filter into its erased form.
///
/// A message that fails to downcast (which would mean the registry
/// wired the wrong action to this filter) makes the filter abstain.
pub fn filter_fn<M, F, Fut>(f: F) -> ErasedFilter
where
    M: OcppRequest,
    F: Fn(RequestContext, Arc<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FilterDecision<M>> + Send + 'static,
{
    Arc::new(move |ctx: RequestContext, any: AnyMessage| {
        let Some(typed) = any.downcast::<M>() else {
            return Box::pin(async { FilterVerdict::Forward }) as FilterFuture;
        };
        let fut = f(ctx, typed);
        Box::pin(async move {
            match fut.await {
                FilterDecision::Forward => FilterVerdict::Forward,
                FilterDecision::Replace(new) => FilterVerdict::Replace(AnyMessage::new(new)),
                FilterDecision::Reject { reason, response } => FilterVerdict::Reject {
                    reason,
                    payload: response
                        .and_then(|r| serde_json::to_value(&r).ok())
                        .map(Payload::Json),
                },
                FilterDecision::Drop { reason } => FilterVerdict::Drop { reason },
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::envelope::RequestEnvelope;
    use crate::wire::ids::NodeId;
    use crate::wire::path::Destination;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct EchoRequest {
        text: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct EchoResponse {
        text: String,
    }

    impl OcppRequest for EchoRequest {
        const ACTION: &'static str = "Echo";
        type Response = EchoResponse;
    }
    impl crate::routing::codec::OcppResponse for EchoResponse {}

    fn context() -> RequestContext {
        RequestContext {
            origin: NodeId::new("CS-1"),
            envelope: Arc::new(RequestEnvelope::call(
                "Echo",
                Payload::empty(),
                Destination::Node(NodeId::csms()),
            )),
        }
    }

    #[tokio::test]
    async fn typed_reject_carries_serialized_response() {
        let filter = filter_fn::<EchoRequest, _, _>(|_ctx, req| async move {
            FilterDecision::reject_with(
                "no echoes today",
                EchoResponse {
                    text: format!("rejected: {}", req.text),
                },
            )
        });

        let verdict = filter(context(), AnyMessage::new(EchoRequest { text: "hi".into() })).await;
        match verdict {
            FilterVerdict::Reject { reason, payload } => {
                assert_eq!(reason, "no echoes today");
                let json = payload.unwrap();
                assert_eq!(json.as_json().unwrap()["text"], "rejected: hi");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replace_rewraps_the_new_request() {
        let filter = filter_fn::<EchoRequest, _, _>(|_ctx, req| async move {
            FilterDecision::Replace(EchoRequest {
                text: req.text.to_uppercase(),
            })
        });

        let verdict = filter(context(), AnyMessage::new(EchoRequest { text: "hi".into() })).await;
        match verdict {
            FilterVerdict::Replace(any) => {
                assert_eq!(any.downcast::<EchoRequest>().unwrap().text, "HI");
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_type_abstains() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct OtherRequest {}
        impl OcppRequest for OtherRequest {
            const ACTION: &'static str = "Other";
            type Response = EchoResponse;
        }

        let filter = filter_fn::<EchoRequest, _, _>(|_ctx, _req| async move {
            FilterDecision::dropped("should never run")
        });

        let verdict = filter(context(), AnyMessage::new(OtherRequest {})).await;
        assert!(matches!(verdict, FilterVerdict::Forward));
    }
}
