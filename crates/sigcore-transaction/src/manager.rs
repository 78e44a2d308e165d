//! Transaction registry, inbound dispatch, and the timer-wheel glue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sigcore_sip::{Method, SipMessage, StatusCode};
use sigcore_transport::{Protocol, Transport, TransportEvent};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::key::TransactionKey;
use crate::timer::{TimerSettings, TimerWheel};
use crate::transaction::{Action, Kind, Transaction};

/// Callbacks the transaction layer drives into the transaction-user layer
/// above it. An ACK to a 2xx response and the 2xx response itself bypass
/// the transaction layer per RFC 3261 §13.2.2.4 / §17.1.1.3 and never
/// reach this trait through [`TransactionUser::on_response`] /
/// [`TransactionUser::on_new_server_transaction`]; they arrive via
/// [`TransactionUser::on_ack_or_2xx`] instead.
#[async_trait]
pub trait TransactionUser: Send + Sync {
    /// An inbound request didn't match any existing transaction; a new
    /// server transaction was created for it.
    async fn on_new_server_transaction(&self, key: TransactionKey, request: Box<SipMessage>, source: SocketAddr);

    /// A response (provisional or final, except a bypassed 2xx-to-INVITE)
    /// arrived on a client transaction, or the manager synthesized a
    /// 408/503 after a timeout or transport failure.
    async fn on_response(&self, key: TransactionKey, response: Box<SipMessage>);

    /// An ACK that doesn't correlate to a live server INVITE transaction
    /// in `Completed` (i.e. it acknowledges a 2xx, or a retransmitted ACK
    /// arrived after Confirmed/Terminated) — routed directly to the
    /// transaction user rather than absorbed here.
    async fn on_ack_or_2xx(&self, request: Box<SipMessage>, source: SocketAddr);
}

struct Entry {
    transaction: Mutex<Transaction>,
    original_request: Box<SipMessage>,
}

pub struct TransactionManager {
    transactions: DashMap<TransactionKey, Arc<Entry>>,
    transports: DashMap<Protocol, Arc<dyn Transport>>,
    timers: TimerSettings,
    wheel: Arc<TimerWheel>,
    user: Arc<dyn TransactionUser>,
    /// `useSourceAddressForResponses` (§4.3/§6): when set, every server
    /// transaction answers to the packet's source address regardless of
    /// what the top Via's `sent-by`/`received`/`rport` would otherwise
    /// resolve to.
    use_source_address_for_responses: AtomicBool,
}

impl TransactionManager {
    pub fn spawn(timers: TimerSettings, user: Arc<dyn TransactionUser>) -> Arc<Self> {
        let (wheel, mut fired_rx) = TimerWheel::spawn();
        let manager = Arc::new(TransactionManager {
            transactions: DashMap::new(),
            transports: DashMap::new(),
            timers,
            wheel,
            user,
            use_source_address_for_responses: AtomicBool::new(false),
        });

        let driver = manager.clone();
        tokio::spawn(async move {
            while let Some(fired) = fired_rx.recv().await {
                driver.on_timer_fired(fired.key, fired.kind).await;
            }
        });

        manager
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.protocol(), transport);
    }

    pub fn set_use_source_address_for_responses(&self, enabled: bool) {
        self.use_source_address_for_responses.store(enabled, Ordering::Relaxed);
    }

    fn transport_for(&self, protocol: Protocol) -> Option<Arc<dyn Transport>> {
        self.transports.get(&protocol).map(|t| t.clone())
    }

    fn no_listener_error(key: TransactionKey, protocol: Protocol) -> Error {
        Error::Transport { key, source: sigcore_transport::Error::NoListener { protocol: protocol.as_str() } }
    }

    /// Starts a client transaction for `request`, sending it immediately.
    /// If a transaction with the same key (method + branch) already
    /// exists, returns it unchanged instead of creating a second one —
    /// callers that want an independent retry must generate a fresh
    /// branch via [`crate::key::generate_branch`] first.
    pub async fn create_client_transaction(&self, request: SipMessage, destination: SocketAddr, protocol: Protocol) -> Result<TransactionKey> {
        let key = TransactionKey::for_request(&request, false)?;
        if self.transactions.contains_key(&key) {
            return Ok(key);
        }

        let method = request.method().cloned().ok_or(Error::MissingVia)?;
        let kind = Kind::for_request(&method, false);
        let mut transaction = Transaction::new_client(key.clone(), kind, destination, protocol, self.timers);
        transaction.last_sent = Some(Box::new(request.clone()));
        let actions = transaction.initial_actions();

        let entry = Arc::new(Entry { transaction: Mutex::new(transaction), original_request: Box::new(request.clone()) });
        self.transactions.insert(key.clone(), entry);

        let Some(transport) = self.transport_for(protocol) else {
            self.transactions.remove(&key);
            return Err(Self::no_listener_error(key, protocol));
        };
        if let Err(source) = transport.send(&request, destination).await {
            self.transactions.remove(&key);
            return Err(Error::Transport { key, source });
        }
        self.apply_actions(&key, actions).await;
        Ok(key)
    }

    /// Sends a response for a server transaction, driving its FSM.
    pub async fn respond(&self, key: &TransactionKey, response: SipMessage) -> Result<()> {
        let entry = self.transactions.get(key).map(|e| e.clone()).ok_or_else(|| Error::NotFound(key.clone()))?;
        let status = response.status().ok_or(Error::MissingCSeq)?;
        let (peer, protocol, actions) = {
            let mut transaction = entry.transaction.lock().await;
            transaction.last_sent = Some(Box::new(response.clone()));
            (transaction.peer, transaction.protocol, transaction.on_response_to_send(status))
        };

        let transport = self.transport_for(protocol).ok_or_else(|| Self::no_listener_error(key.clone(), protocol))?;
        transport.send(&response, peer).await.map_err(|source| Error::Transport { key: key.clone(), source })?;
        self.apply_actions(key, actions).await;
        Ok(())
    }

    /// Feeds a transport-layer event into the transaction layer.
    pub async fn handle_inbound(&self, event: TransportEvent) {
        let TransportEvent::MessageReceived { message, source, protocol, .. } = event else { return };

        if message.is_request() {
            self.handle_inbound_request(message, source, protocol).await;
        } else {
            self.handle_inbound_response(message).await;
        }
    }

    async fn handle_inbound_request(&self, message: Box<SipMessage>, source: SocketAddr, protocol: Protocol) {
        let Some(method) = message.method().cloned() else { return };

        if method == Method::Ack {
            let key = match TransactionKey::for_request(&message, true) {
                Ok(key) => key,
                Err(_) => return self.user.on_ack_or_2xx(message, source).await,
            };
            match self.transactions.get(&key).map(|e| e.clone()) {
                Some(entry) => {
                    let actions = entry.transaction.lock().await.on_ack();
                    if matches!(actions.first(), Some(Action::None)) {
                        // Not a Completed server-INVITE transaction (e.g. this ACK
                        // belongs to a 2xx, whose transaction already terminated).
                        self.user.on_ack_or_2xx(message, source).await;
                    } else {
                        self.apply_actions(&key, actions).await;
                    }
                }
                None => self.user.on_ack_or_2xx(message, source).await,
            }
            return;
        }

        let key = match TransactionKey::for_request(&message, true) {
            Ok(key) => key,
            Err(err) => {
                warn!(%err, "dropping inbound request with unparseable transaction key");
                return;
            }
        };

        if let Some(entry) = self.transactions.get(&key).map(|e| e.clone()) {
            let actions = entry.transaction.lock().await.on_request_retransmit();
            self.apply_actions(&key, actions).await;
            return;
        }

        let mut message = message;
        let response_peer = self.stamp_via_and_resolve_peer(&mut message, source);

        let kind = Kind::for_request(&method, true);
        let transaction = Transaction::new_server(key.clone(), kind, response_peer, protocol, self.timers);
        let entry = Arc::new(Entry { transaction: Mutex::new(transaction), original_request: message.clone() });
        self.transactions.insert(key.clone(), entry);
        self.user.on_new_server_transaction(key, message, source).await;
    }

    /// Stamps `received`/`rport` onto the request's top Via if the
    /// source address needs them, then resolves where this server
    /// transaction's responses should go per §4.3's Via-handling rules.
    /// Mutates `message` in place and returns the resolved peer.
    fn stamp_via_and_resolve_peer(&self, message: &mut SipMessage, source: SocketAddr) -> SocketAddr {
        let Some(raw_via) = message.headers.get("via").map(str::to_string) else { return source };
        let stamped = sigcore_transport::stamp_received_and_rport(&raw_via, source);
        let use_source = self.use_source_address_for_responses.load(Ordering::Relaxed);
        let peer = match sigcore_transport::parse_sent_by(&stamped) {
            Some(via) => sigcore_transport::resolve_response_target(&via, source, use_source),
            None => source,
        };
        message.headers.set_first("via", stamped);
        peer
    }

    async fn handle_inbound_response(&self, message: Box<SipMessage>) {
        let key = match TransactionKey::for_response(&message, false) {
            Ok(key) => key,
            Err(err) => {
                debug!(%err, "dropping response with no correlating transaction");
                return;
            }
        };
        let Some(entry) = self.transactions.get(&key).map(|e| e.clone()) else {
            debug!(%key, "stray response matched no client transaction");
            return;
        };
        let Some(status) = message.status() else { return };
        let actions = entry.transaction.lock().await.on_response(status);
        self.user.on_response(key.clone(), message).await;
        self.apply_actions(&key, actions).await;
    }

    async fn on_timer_fired(&self, key: TransactionKey, kind: crate::timer::TimerKind) {
        let Some(entry) = self.transactions.get(&key).map(|e| e.clone()) else { return };
        let actions = entry.transaction.lock().await.on_timer(kind);
        self.apply_actions(&key, actions).await;
    }

    async fn apply_actions(&self, key: &TransactionKey, actions: Vec<Action>) {
        let mut terminate = false;
        let mut fire_timeout = false;
        for action in actions {
            match action {
                Action::None => {}
                Action::Retransmit => {
                    if let Some(entry) = self.transactions.get(key).map(|e| e.clone()) {
                        let transaction = entry.transaction.lock().await;
                        if let Some(last) = &transaction.last_sent {
                            if let Some(transport) = self.transport_for(transaction.protocol) {
                                if let Err(err) = transport.send(last, transaction.peer).await {
                                    warn!(%key, %err, "retransmit failed");
                                }
                            }
                        }
                    }
                }
                Action::ArmTimer { kind, delay } => self.wheel.arm(key.clone(), kind, delay),
                Action::CancelTimer(kind) => self.wheel.cancel(key, kind),
                Action::FireTimeout => fire_timeout = true,
                Action::Terminate => terminate = true,
            }
        }

        if fire_timeout {
            if let Some(entry) = self.transactions.get(key).map(|e| e.clone()) {
                let synthetic = synthesize_error_response(&entry.original_request, sigcore_sip::types::status::REQUEST_TIMEOUT);
                self.user.on_response(key.clone(), Box::new(synthetic)).await;
            }
        }

        if terminate {
            self.wheel.cancel_all(key);
            self.transactions.remove(key);
        }
    }
}

/// Builds a synthetic final response for a request whose transaction
/// never got a real one, copying the headers a UAC needs to correlate it
/// (RFC 3261 §17.1.1.2's implied timeout-to-408 behavior).
fn synthesize_error_response(request: &SipMessage, status: StatusCode) -> SipMessage {
    let mut response = SipMessage::response(status, status.default_reason());
    for name in ["via", "from", "to", "call-id", "cseq"] {
        for value in request.headers.get_all(name) {
            response.headers.append(name, value.clone());
        }
    }
    response.sync_content_length();
    response
}

#[cfg(test)]
mod via_routing_tests {
    use std::sync::Arc;

    use sigcore_sip::{Method, SipMessage, SipUri};

    use super::*;

    struct Discard;

    #[async_trait]
    impl TransactionUser for Discard {
        async fn on_new_server_transaction(&self, _key: TransactionKey, _request: Box<SipMessage>, _source: SocketAddr) {}
        async fn on_response(&self, _key: TransactionKey, _response: Box<SipMessage>) {}
        async fn on_ack_or_2xx(&self, _request: Box<SipMessage>, _source: SocketAddr) {}
    }

    fn manager() -> Arc<TransactionManager> {
        TransactionManager::spawn(TimerSettings::default(), Arc::new(Discard))
    }

    #[tokio::test]
    async fn rport_request_resolves_response_to_the_reflected_source() {
        let manager = manager();
        let mut msg = SipMessage::request(Method::Invite, SipUri::sip("example.com"));
        msg.headers.append("Via", "SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1;rport");
        let source: SocketAddr = "203.0.113.9:5070".parse().unwrap();

        let peer = manager.stamp_via_and_resolve_peer(&mut msg, source);
        assert_eq!(peer, source);
        assert!(msg.headers.get("via").unwrap().contains("rport=5070"));
        assert!(msg.headers.get("via").unwrap().contains("received=203.0.113.9"));
    }

    #[tokio::test]
    async fn public_sent_by_with_no_nat_markers_is_trusted() {
        let manager = manager();
        let mut msg = SipMessage::request(Method::Invite, SipUri::sip("example.com"));
        msg.headers.append("Via", "SIP/2.0/UDP 198.51.100.2:5060;branch=z9hG4bK1");
        let source: SocketAddr = "198.51.100.2:5060".parse().unwrap();

        let peer = manager.stamp_via_and_resolve_peer(&mut msg, source);
        assert_eq!(peer, "198.51.100.2:5060".parse().unwrap());
        assert_eq!(msg.headers.get("via").unwrap(), "SIP/2.0/UDP 198.51.100.2:5060;branch=z9hG4bK1");
    }

    #[tokio::test]
    async fn use_source_address_override_ignores_via_entirely() {
        let manager = manager();
        manager.set_use_source_address_for_responses(true);
        let mut msg = SipMessage::request(Method::Invite, SipUri::sip("example.com"));
        msg.headers.append("Via", "SIP/2.0/UDP 198.51.100.2:5060;branch=z9hG4bK1");
        let source: SocketAddr = "10.1.1.1:12345".parse().unwrap();

        let peer = manager.stamp_via_and_resolve_peer(&mut msg, source);
        assert_eq!(peer, source);
    }
}
