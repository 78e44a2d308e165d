//! The handler capability trait the B2BUA dispatches to, and the small
//! types it passes across that boundary.
//!
//! The source models handlers as abstract base classes (`SIPB2BHandler`,
//! `SIPB2BUserAgentHandler`) with virtual dispatch. A trait object keyed by
//! method is the equivalent here: the registry stores `Arc<dyn B2bHandler>`,
//! and a compile-time-linked set of handler constructors stands in for the
//! dynamically loaded plugin modules.

use std::net::SocketAddr;

use async_trait::async_trait;
use sigcore_sip::{Method, SipMessage};
use sigcore_transport::Protocol;

/// The method buckets the handler registry dispatches on. `Default` is the
/// fallback used when no method-specific or domain handler matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Invite,
    Register,
    Subscribe,
    Notify,
    Message,
    Options,
    Bye,
    Cancel,
    Ack,
    Prack,
    Info,
    Refer,
    Update,
    Publish,
    Default,
}

impl MessageType {
    pub fn from_method(method: &Method) -> Self {
        match method {
            Method::Invite => MessageType::Invite,
            Method::Register => MessageType::Register,
            Method::Subscribe => MessageType::Subscribe,
            Method::Notify => MessageType::Notify,
            Method::Message => MessageType::Message,
            Method::Options => MessageType::Options,
            Method::Bye => MessageType::Bye,
            Method::Cancel => MessageType::Cancel,
            Method::Ack => MessageType::Ack,
            Method::Prack => MessageType::Prack,
            Method::Info => MessageType::Info,
            Method::Refer => MessageType::Refer,
            Method::Update => MessageType::Update,
            Method::Publish => MessageType::Publish,
            Method::Extension(_) => MessageType::Default,
        }
    }
}

/// What `on_route_transaction` decided: where to send the forwarded
/// request from and to.
#[derive(Debug, Clone, Copy)]
pub struct RouteDecision {
    pub local_interface: SocketAddr,
    pub target: SocketAddr,
    /// Transport the paired outbound client transaction is created on.
    /// The B2BUA may switch transports between the inbound and outbound
    /// leg (e.g. WS inbound, UDP outbound to the final hop).
    pub protocol: Protocol,
}

/// A method/domain handler consulted by the ingress and egress pipelines.
/// Every hook has a default no-op (or pass-through) implementation so a
/// handler only needs to override the steps it cares about; `on_route_transaction`
/// is the one mandatory decision every handler must make.
#[async_trait]
pub trait B2bHandler: Send + Sync {
    fn supported_methods(&self) -> &[MessageType];

    /// May return a final response (401/407) to challenge the request
    /// instead of routing it.
    async fn on_authenticate_transaction(&self, _request: &SipMessage) -> Option<SipMessage> {
        None
    }

    /// Decides where the paired outbound request goes, or rejects the
    /// request with a final response (e.g. 404 Not Found).
    async fn on_route_transaction(&self, request: &SipMessage) -> Result<RouteDecision, SipMessage>;

    /// Called instead of routing when the request carries
    /// `generate-local-response=1`.
    async fn on_generate_local_response(&self, request: &SipMessage) -> SipMessage;

    /// Called instead of routing when the request carries
    /// `invoke-local-handler=1` (locally terminated REGISTER, etc). A
    /// `Some` response is sent back on the server transaction in lieu of
    /// forwarding; `None` leaves the transaction open for the handler to
    /// answer out of band (e.g. after an async registrar write).
    async fn on_invoke_local_handler(&self, _request: &SipMessage) -> Option<SipMessage> {
        None
    }

    async fn on_process_request_body(&self, _request: &mut SipMessage) {}
    async fn on_process_outbound(&self, _request: &mut SipMessage) {}

    async fn on_process_client_response(&self, _response: &mut SipMessage) {}
    async fn on_process_response_inbound(&self, _response: &mut SipMessage) {}
    async fn on_process_response_outbound(&self, _response: &mut SipMessage) {}

    /// Optional post-route hook run after the client transaction is
    /// created, e.g. for logging or metrics.
    async fn on_post_route(&self, _request: &SipMessage, _decision: &RouteDecision) {}

    async fn on_error(&self, _request: &SipMessage, _error: &crate::error::Error) {}
}

/// A plugin hook consulted before the handler registry, in registration
/// order. The first one to return `Some(response)` hijacks the
/// transaction: the manager sends that response directly and never
/// creates a paired outbound transaction.
#[async_trait]
pub trait UserAgentHandler: Send + Sync {
    async fn handle_request(&self, request: &SipMessage) -> Option<SipMessage>;
}
