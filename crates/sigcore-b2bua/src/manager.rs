//! The B2BUA transaction manager: pairs an inbound server transaction
//! with an outbound client transaction and drives both through the
//! ingress/egress pipeline in §4.4, grounded directly on
//! `SIPB2BTransactionManager` in the original source.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sigcore_sip::types::status;
use sigcore_sip::SipMessage;
use sigcore_transaction::{TransactionKey, TransactionManager, TransactionUser};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::handler::{B2bHandler, RouteDecision, UserAgentHandler};
use crate::registry::HandlerRegistry;

/// Pairs a server transaction with the (possibly not-yet-created) client
/// transaction routing decided for it, plus the handler consulted for
/// the pairing's lifetime and a dialog hint for correlation/logging.
#[derive(Clone)]
struct B2bPairing {
    server_tx: TransactionKey,
    client_tx: Option<TransactionKey>,
    handler: Arc<dyn B2bHandler>,
    dialog_hint: Option<String>,
}

/// Replaces the manager's default ingress pipeline entirely when
/// installed via [`B2buaManager::set_external_dispatch`] — used for
/// embedding the core behind a different orchestration layer.
#[async_trait]
pub trait ExternalDispatch: Send + Sync {
    async fn dispatch(&self, request: Box<SipMessage>, source: SocketAddr);
}

/// Optional hook run once routing has decided where a request is going,
/// after the paired client transaction is created.
#[async_trait]
pub trait PostRouteHook: Send + Sync {
    async fn on_post_route(&self, request: &SipMessage, decision: &RouteDecision);
}

/// Receives the ACK-to-2xx / 2xx-retransmit traffic that bypasses the
/// transaction layer entirely (§4.2). Installed via
/// [`B2buaManager::set_ack_or_2xx_handler`].
#[async_trait]
pub trait AckOr2xxHandler: Send + Sync {
    async fn on_ack_or_2xx(&self, request: Box<SipMessage>, source: SocketAddr);
}

/// Ties the handler registry to a transaction layer: accepts new server
/// transactions from [`TransactionUser::on_new_server_transaction`], runs
/// them through the ingress pipeline, and shuttles client-transaction
/// responses back through the matching server transaction on egress.
pub struct B2buaManager {
    registry: Arc<HandlerRegistry>,
    transactions: OnceCell<Arc<TransactionManager>>,
    /// Keyed by server transaction; the authoritative pairing record.
    pairings: DashMap<TransactionKey, B2bPairing>,
    /// Keyed by client transaction, once created, pointing back at the
    /// server transaction so egress can find its pairing in one lookup.
    by_client: DashMap<TransactionKey, TransactionKey>,
    /// Call-IDs for which a NOTIFY may legitimately arrive before the
    /// SUBSCRIBE it answers has reached a final response.
    pending_subscriptions: DashMap<String, ()>,
    external_dispatch: RwLock<Option<Arc<dyn ExternalDispatch>>>,
    post_route: RwLock<Option<Arc<dyn PostRouteHook>>>,
    ack_or_2xx: RwLock<Option<Arc<dyn AckOr2xxHandler>>>,
}

impl B2buaManager {
    pub fn new(registry: Arc<HandlerRegistry>) -> Arc<Self> {
        Arc::new(B2buaManager {
            registry,
            transactions: OnceCell::new(),
            pairings: DashMap::new(),
            by_client: DashMap::new(),
            pending_subscriptions: DashMap::new(),
            external_dispatch: RwLock::new(None),
            post_route: RwLock::new(None),
            ack_or_2xx: RwLock::new(None),
        })
    }

    pub async fn set_ack_or_2xx_handler(&self, handler: Arc<dyn AckOr2xxHandler>) {
        *self.ack_or_2xx.write().await = Some(handler);
    }

    /// The handler registry this manager dispatches inbound requests
    /// against — exposed so a facade can register/unregister handlers
    /// without re-implementing the lookup rules in §4.4.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Binds the transaction layer this manager drives. Must be called
    /// exactly once, after `TransactionManager::spawn` has been handed
    /// this manager as its `TransactionUser` (the two are mutually
    /// referential, so construction is two-phase).
    pub fn attach_transactions(&self, transactions: Arc<TransactionManager>) {
        let _ = self.transactions.set(transactions);
    }

    fn transactions(&self) -> &Arc<TransactionManager> {
        self.transactions.get().expect("attach_transactions must be called before the manager processes traffic")
    }

    pub async fn set_external_dispatch(&self, dispatch: Arc<dyn ExternalDispatch>) {
        *self.external_dispatch.write().await = Some(dispatch);
    }

    pub async fn set_post_route_hook(&self, hook: Arc<dyn PostRouteHook>) {
        *self.post_route.write().await = Some(hook);
    }

    /// Marks `call_id` as expecting an out-of-order NOTIFY before its
    /// SUBSCRIBE completes. Cleared once the NOTIFY (or the SUBSCRIBE's
    /// final response) has been observed.
    pub fn note_pending_subscription(&self, call_id: impl Into<String>) {
        self.pending_subscriptions.insert(call_id.into(), ());
    }

    pub fn is_pending_subscription(&self, call_id: &str) -> bool {
        self.pending_subscriptions.contains_key(call_id)
    }

    #[instrument(skip(self, request), fields(call_id = request.call_id().unwrap_or("-")))]
    async fn ingress(&self, server_key: TransactionKey, request: Box<SipMessage>, source: SocketAddr) -> Result<()> {
        // Step 2: plugin hijack, consulted in registration order before any
        // method/domain handler; the first response short-circuits.
        for plugin in self.registry.user_agent_handlers().await {
            if let Some(response) = plugin.handle_request(&request).await {
                return self.send_final(&server_key, response).await;
            }
        }

        let Some(handler) = self.registry.resolve(&request) else {
            let method = request.method().map(ToString::to_string).unwrap_or_default();
            return Err(Error::NoHandler(method));
        };

        // Step 3: authentication challenge.
        if let Some(challenge) = handler.on_authenticate_transaction(&request).await {
            return self.send_final(&server_key, challenge).await;
        }

        // Step 4: routing decision, or rejection (e.g. 404).
        let decision = match handler.on_route_transaction(&request).await {
            Ok(decision) => decision,
            Err(rejection) => return self.send_final(&server_key, rejection).await,
        };

        // Step 5: locally generated response, no forking.
        if request.properties.get("generate-local-response").map(String::as_str) == Some("1") {
            let response = handler.on_generate_local_response(&request).await;
            return self.send_final(&server_key, response).await;
        }

        // Step 6: locally invoked handler (e.g. locally terminated REGISTER).
        if request.properties.get("invoke-local-handler").map(String::as_str) == Some("1") {
            if let Some(response) = handler.on_invoke_local_handler(&request).await {
                return self.send_final(&server_key, response).await;
            }
            debug!("invoke-local-handler left the transaction open for an out-of-band answer");
            return Ok(());
        }

        // Step 7: last-chance mutation before the request is forwarded.
        let mut outbound = (*request).clone();
        handler.on_process_request_body(&mut outbound).await;
        handler.on_process_outbound(&mut outbound).await;

        // Step 8: optional post-route callback runs after the pairing is
        // recorded but is invoked once the client transaction exists below.

        // Step 9: create the paired client transaction and forward.
        let dialog_hint = outbound.dialog_id();
        let pairing = B2bPairing { server_tx: server_key.clone(), client_tx: None, handler: handler.clone(), dialog_hint };
        self.pairings.insert(server_key.clone(), pairing);

        let client_key = self
            .transactions()
            .create_client_transaction(outbound, decision.target, decision.protocol)
            .await
            .map_err(Error::Transaction)?;

        if let Some(mut pairing) = self.pairings.get_mut(&server_key) {
            pairing.client_tx = Some(client_key.clone());
        }
        self.by_client.insert(client_key, server_key.clone());

        if let Some(hook) = self.post_route.read().await.clone() {
            hook.on_post_route(&request, &decision).await;
        }
        handler.on_post_route(&request, &decision).await;

        let _ = source;
        Ok(())
    }

    async fn egress(&self, client_key: TransactionKey, response: Box<SipMessage>) {
        let Some(server_key) = self.by_client.get(&client_key).map(|e| e.clone()) else {
            warn!(%client_key, "response on client transaction with no B2BUA pairing");
            return;
        };
        let Some(pairing) = self.pairings.get(&server_key).map(|e| e.clone()) else {
            warn!(%server_key, "pairing disappeared before its client transaction answered");
            return;
        };

        let mut response = *response;
        pairing.handler.on_process_client_response(&mut response).await;
        pairing.handler.on_process_response_inbound(&mut response).await;
        pairing.handler.on_process_response_outbound(&mut response).await;

        let is_final = response.status().map(|s| s.is_final()).unwrap_or(true);
        if let Err(err) = self.transactions().respond(&server_key, response).await {
            warn!(%server_key, %err, "failed to relay response to server transaction");
        }

        if is_final {
            self.pairings.remove(&server_key);
            self.by_client.remove(&client_key);
        }
    }

    /// Sends `response` directly on the server transaction without ever
    /// creating a paired client transaction (hijack, auth challenge,
    /// route rejection, or a locally generated answer).
    async fn send_final(&self, server_key: &TransactionKey, response: SipMessage) -> Result<()> {
        self.transactions().respond(server_key, response).await.map_err(Error::Transaction)
    }

    async fn respond_with_status(&self, server_key: &TransactionKey, request: &SipMessage, status: sigcore_sip::StatusCode) {
        let mut response = SipMessage::response(status, status.default_reason());
        for name in ["via", "from", "to", "call-id", "cseq"] {
            for value in request.headers.get_all(name) {
                response.headers.append(name, value.clone());
            }
        }
        response.sync_content_length();
        let _ = self.send_final(server_key, response).await;
    }
}

#[async_trait]
impl TransactionUser for B2buaManager {
    /// Step 1 (`on_transaction_created`) is implicit here: the moment a
    /// new server transaction exists is this call itself, so there is no
    /// separate early hook to invoke before the hijack pass.
    async fn on_new_server_transaction(&self, key: TransactionKey, request: Box<SipMessage>, source: SocketAddr) {
        if let Some(dispatch) = self.external_dispatch.read().await.clone() {
            dispatch.dispatch(request, source).await;
            return;
        }

        let request_for_error = request.clone();
        if let Err(err) = self.ingress(key.clone(), request, source).await {
            warn!(%key, %err, "ingress pipeline failed, answering 500");
            self.respond_with_status(&key, &request_for_error, status::SERVER_INTERNAL_ERROR).await;
        }
    }

    async fn on_response(&self, key: TransactionKey, response: Box<SipMessage>) {
        self.egress(key, response).await;
    }

    async fn on_ack_or_2xx(&self, request: Box<SipMessage>, source: SocketAddr) {
        if let Some(handler) = self.ack_or_2xx.read().await.clone() {
            handler.on_ack_or_2xx(request, source).await;
        } else {
            debug!(call_id = request.call_id().unwrap_or("-"), %source, "ACK/2xx bypassing the transaction layer with no handler installed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MessageType;
    use sigcore_sip::{Method, SipUri};
    use sigcore_transport::Protocol;

    struct AlwaysNotFound;

    #[async_trait]
    impl B2bHandler for AlwaysNotFound {
        fn supported_methods(&self) -> &[MessageType] {
            &[MessageType::Default]
        }

        async fn on_route_transaction(&self, _request: &SipMessage) -> std::result::Result<RouteDecision, SipMessage> {
            Err(SipMessage::response(sigcore_sip::types::status::NOT_FOUND, "Not Found"))
        }

        async fn on_generate_local_response(&self, _request: &SipMessage) -> SipMessage {
            SipMessage::response(sigcore_sip::types::status::OK, "OK")
        }
    }

    fn sample_request() -> Box<SipMessage> {
        let mut msg = SipMessage::request(Method::Invite, SipUri::sip("example.com"));
        msg.headers.append("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-1");
        msg.headers.append("Call-ID", "c1");
        msg.headers.append("CSeq", "1 INVITE");
        Box::new(msg)
    }

    #[tokio::test]
    async fn no_handler_registered_is_reported_as_an_error() {
        let registry = Arc::new(HandlerRegistry::new());
        let manager = B2buaManager::new(registry);
        let key = TransactionKey::new("z9hG4bK-1", Method::Invite, true);
        let source: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let err = manager.ingress(key, sample_request(), source).await.unwrap_err();
        assert!(matches!(err, Error::NoHandler(_)));
    }

    #[tokio::test]
    async fn pending_subscription_tracking_round_trips() {
        let registry = Arc::new(HandlerRegistry::new());
        let manager = B2buaManager::new(registry);
        manager.note_pending_subscription("call-1");
        assert!(manager.is_pending_subscription("call-1"));
        assert!(!manager.is_pending_subscription("call-2"));
    }

    #[test]
    fn route_decision_carries_protocol_for_the_outbound_leg() {
        let decision = RouteDecision {
            local_interface: "10.0.0.1:5060".parse().unwrap(),
            target: "10.0.0.2:5060".parse().unwrap(),
            protocol: Protocol::Udp,
        };
        assert_eq!(decision.protocol, Protocol::Udp);
    }
}
