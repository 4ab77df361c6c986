//! Networking node composition root
//!
//! One [`NetworkingNode`] owns every long-lived piece of a node: the
//! message registry, peer and route tables, the correlation tracker,
//! the event bus and the three traffic adapters. [`dispatch_text`] is
//! the single entry point for raw frames arriving on any link; it
//! decides whether a frame is answered here, relayed onward, or
//! resolves a pending call.
//!
//! [`dispatch_text`]: NetworkingNode::dispatch_text

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::info;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::adapters::{
    CallResponse, ForwardAdapter, InboundAdapter, InboundReply, NodeTransport, OutboundAdapter,
};
use crate::config::{AppConfig, ConfigError};
use crate::correlation::RequestTracker;
use crate::events::bus::EventBus;
use crate::events::kinds::{
    ErrorEvent, Event, LateResponseEvent, PeerConnectedEvent, PeerDisconnectedEvent,
    RouteLearnedEvent,
};
use crate::routing::codec::OcppRequest;
use crate::routing::decision::DefaultPolicy;
use crate::routing::engine::ForwardingEngine;
use crate::routing::registry::MessageRegistry;
use crate::session::connection::{LinkMessage, PeerRole};
use crate::session::registry::PeerRegistry;
use crate::session::routes::{RelayTable, RouteTable};
use crate::shared::errors::SendError;
use crate::shared::shutdown::ShutdownSignal;
use crate::wire::envelope::RequestEnvelope;
use crate::wire::frame::{Frame, NetworkingMode};
use crate::wire::ids::{NodeId, RequestId};
use crate::wire::path::{Destination, NetworkPath};
use crate::wire::signature::{SignatureKeyring, VerifyMode};

/// How often relay entries and quiet links are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

struct NodeOptions {
    default_policy: DefaultPolicy,
    keyring: Arc<SignatureKeyring>,
    verify: VerifyMode,
    sign_key: Option<String>,
    request_timeout: Duration,
    relay_ttl: Duration,
    stale_timeout: i64,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::default(),
            keyring: Arc::new(SignatureKeyring::new()),
            verify: VerifyMode::Off,
            sign_key: None,
            request_timeout: Duration::from_secs(30),
            relay_ttl: Duration::from_secs(120),
            stale_timeout: 300,
        }
    }
}

/// Everything a running node is made of.
pub struct NetworkingNode {
    node_id: NodeId,
    registry: Arc<MessageRegistry>,
    peers: Arc<PeerRegistry>,
    routes: Arc<RouteTable>,
    relays: Arc<RelayTable>,
    tracker: Arc<RequestTracker>,
    events: EventBus,
    transport: Arc<NodeTransport>,
    inbound: InboundAdapter,
    outbound: OutboundAdapter,
    forward: ForwardAdapter,
    request_timeout: Duration,
    relay_ttl: Duration,
    stale_timeout: i64,
}

impl NetworkingNode {
    /// Build a node with defaults: forward-by-default policy, no
    /// signature checking, 30s request timeout.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::assemble(node_id.into(), NodeOptions::default())
    }

    /// Build a node from loaded configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let keyring = Arc::new(config.build_keyring()?);
        Ok(Self::assemble(
            NodeId::new(&config.node.id),
            NodeOptions {
                default_policy: config.routing.default_policy,
                keyring,
                verify: config.signing.verify,
                sign_key: config.signing.sign_key.clone(),
                request_timeout: config.request_timeout(),
                relay_ttl: config.relay_ttl(),
                stale_timeout: config.node.stale_timeout_seconds,
            },
        ))
    }

    fn assemble(node_id: NodeId, options: NodeOptions) -> Self {
        let registry = Arc::new(MessageRegistry::new());
        let peers = Arc::new(PeerRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let relays = Arc::new(RelayTable::new());
        let tracker = Arc::new(RequestTracker::new());
        let events = EventBus::new();

        let transport = Arc::new(NodeTransport::new(
            node_id.clone(),
            peers.clone(),
            routes.clone(),
        ));
        let engine = Arc::new(
            ForwardingEngine::new(node_id.clone(), registry.clone(), events.clone())
                .with_default_policy(options.default_policy)
                .with_signature_policy(
                    options.keyring.clone(),
                    options.verify,
                    options.sign_key.clone(),
                ),
        );
        let inbound = InboundAdapter::new(node_id.clone(), registry.clone(), events.clone())
            .with_signature_policy(
                options.keyring.clone(),
                options.verify,
                options.sign_key.clone(),
            );
        let outbound = OutboundAdapter::new(tracker.clone(), transport.clone(), events.clone())
            .with_signature_policy(options.keyring, options.verify, options.sign_key);
        let forward = ForwardAdapter::new(
            node_id.clone(),
            engine,
            transport.clone(),
            relays.clone(),
        );

        Self {
            node_id,
            registry,
            peers,
            routes,
            relays,
            tracker,
            events,
            transport,
            inbound,
            outbound,
            forward,
            request_timeout: options.request_timeout,
            relay_ttl: options.relay_ttl,
            stale_timeout: options.stale_timeout,
        }
    }

    // ── Accessors ──────────────────────────────────────────

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Action registrations, handlers and filters live here.
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Link lifecycle ─────────────────────────────────────

    /// Register a link and hand back the channel its write half must
    /// drain. A reconnecting peer replaces its previous link.
    pub fn attach_peer(
        &self,
        peer_id: NodeId,
        role: PeerRole,
        mode: NetworkingMode,
        remote_addr: Option<String>,
    ) -> mpsc::UnboundedReceiver<LinkMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let replacing = self.peers.is_connected(&peer_id);
        self.peers.register(peer_id.clone(), role, mode, tx);
        if !replacing {
            metrics::gauge!("ocpp_connected_peers").increment(1.0);
        }
        self.events.publish(Event::PeerConnected(PeerConnectedEvent {
            peer_id: peer_id.to_string(),
            role: role.as_str().to_string(),
            remote_addr,
            timestamp: Utc::now(),
        }));
        rx
    }

    /// Drop a link. The write-half channel closes, learned routes
    /// through the peer are forgotten and subscribers hear about it.
    pub fn detach_peer(&self, peer_id: &NodeId, reason: Option<&str>) {
        if !self.peers.is_connected(peer_id) {
            return;
        }
        self.peers.unregister(peer_id);
        metrics::gauge!("ocpp_connected_peers").decrement(1.0);
        let forgotten = self.routes.forget_via(peer_id);
        if forgotten > 0 {
            debug!(peer_id = %peer_id, "forgot {forgotten} routes via detached peer");
        }
        self.events.publish(Event::PeerDisconnected(PeerDisconnectedEvent {
            peer_id: peer_id.to_string(),
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        }));
    }

    // ── Originating traffic ────────────────────────────────

    /// Issue a Call and wait for its typed answer, bounded by the
    /// node's configured request timeout.
    pub async fn call<M: OcppRequest>(
        &self,
        destination: Destination,
        request: &M,
    ) -> CallResponse<M::Response> {
        self.outbound
            .call_with_timeout(destination, request, Some(self.request_timeout))
            .await
    }

    /// Issue a Call with an explicit timeout.
    pub async fn call_with_timeout<M: OcppRequest>(
        &self,
        destination: Destination,
        request: &M,
        timeout: Duration,
    ) -> CallResponse<M::Response> {
        self.outbound
            .call_with_timeout(destination, request, Some(timeout))
            .await
    }

    /// Issue a fire-and-forget Send.
    pub fn send<M: OcppRequest>(
        &self,
        destination: Destination,
        request: &M,
    ) -> Result<(), SendError> {
        self.outbound.send(destination, request)
    }

    // ── Frame dispatch ─────────────────────────────────────

    /// Route one raw frame that arrived on `origin`'s link.
    pub async fn dispatch_text(&self, origin: &NodeId, text: &str) {
        self.peers.touch(origin);

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                // Without a parsed frame there is no request id to
                // reference, so nothing can be answered.
                warn!(origin = %origin, "dropping unreadable frame: {e}");
                metrics::counter!("ocpp_messages_dropped_total", "reason" => "bad_frame")
                    .increment(1);
                self.events.publish(Event::Error(ErrorEvent {
                    peer_id: Some(origin.to_string()),
                    error_type: "bad_frame".into(),
                    message: e.to_string(),
                    timestamp: Utc::now(),
                }));
                return;
            }
        };

        match frame {
            Frame::Request(mut envelope) => {
                // Classic frames carry no path; the link identity is
                // the origin hop.
                if envelope.path.is_empty() {
                    envelope.path.push(origin.clone());
                }
                self.learn_routes(origin, &envelope.path);

                if envelope.is_addressed_to(&self.node_id) {
                    self.dispatch_local(origin, envelope).await;
                } else {
                    self.forward.relay_request(origin, envelope).await;
                }
            }
            Frame::Response(envelope) => {
                self.learn_routes(origin, &envelope.path);
                if let Err(envelope) = self.tracker.resolve(envelope) {
                    if let Err(envelope) = self.forward.relay_response(envelope) {
                        self.note_late_response(origin, &envelope.request_id);
                    }
                }
            }
            Frame::Error(envelope) => {
                if let Err(envelope) = self.tracker.fail(envelope) {
                    if let Err(envelope) = self.forward.relay_error(envelope) {
                        self.note_late_response(origin, &envelope.request_id);
                    }
                }
            }
        }
    }

    /// Hand a request addressed to this node to the IN adapter and
    /// push whatever it answers back over the link it came from.
    async fn dispatch_local(&self, origin: &NodeId, envelope: RequestEnvelope) {
        match self.inbound.receive(origin, envelope).await {
            InboundReply::Response(response) => {
                if let Err(e) = self.transport.send_response(origin, &response) {
                    warn!(origin = %origin, request_id = %response.request_id,
                        "local response undeliverable: {e}");
                }
            }
            InboundReply::Error(error) => {
                if let Err(e) = self.transport.send_error(origin, &error) {
                    warn!(origin = %origin, request_id = %error.request_id,
                        "local error undeliverable: {e}");
                }
            }
            InboundReply::None => {}
        }
    }

    fn learn_routes(&self, arrived_via: &NodeId, path: &NetworkPath) {
        for node in self.routes.learn_from_path(path, arrived_via, &self.node_id) {
            self.events.publish(Event::RouteLearned(RouteLearnedEvent {
                node_id: node.to_string(),
                via: arrived_via.to_string(),
                timestamp: Utc::now(),
            }));
        }
    }

    /// A CallResult or CallError nothing was waiting for. The pending
    /// entry usually timed out already; these are anomalies worth
    /// counting, not silent drops.
    fn note_late_response(&self, origin: &NodeId, request_id: &RequestId) {
        warn!(origin = %origin, request_id = %request_id,
            "late response: no pending call and no relay entry");
        metrics::counter!("ocpp_late_responses_total").increment(1);
        self.events.publish(Event::LateResponse(LateResponseEvent {
            request_id: request_id.to_string(),
            peer_id: Some(origin.to_string()),
            timestamp: Utc::now(),
        }));
    }

    // ── Maintenance ────────────────────────────────────────

    /// Start the periodic sweep that expires relay entries and drops
    /// links that have gone quiet. Runs until `shutdown` triggers.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: ShutdownSignal) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => node.sweep(),
                    _ = shutdown.wait() => break,
                }
            }
            debug!("maintenance loop stopped");
        });
    }

    fn sweep(&self) {
        let expired = self.relays.purge_expired(self.relay_ttl);
        if expired > 0 {
            debug!("expired {expired} relay entries");
        }
        for peer in self.peers.stale_peers(self.stale_timeout) {
            warn!(peer_id = %peer, "link quiet for over {}s, dropping", self.stale_timeout);
            self.detach_peer(&peer, Some("inactivity timeout"));
        }
    }

    /// Flush everything still waiting on the network. Outstanding
    /// calls resolve with a GenericError result.
    pub fn shutdown(&self, reason: &str) {
        let outstanding = self.tracker.outstanding();
        if outstanding > 0 {
            info!("Flushing {} outstanding requests", outstanding);
        }
        self.tracker.flush_all(reason);
    }
}
