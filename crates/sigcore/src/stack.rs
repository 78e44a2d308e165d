//! The facade described in §4.5: wires transport listeners, the
//! transaction layer, and the B2BUA manager behind one handle, and
//! covers the ad hoc client requests (REGISTER, out-of-dialog OPTIONS,
//! ...) that a handler issues on its own rather than through the
//! automatic server/client pairing in [`sigcore_b2bua::manager`].

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use sigcore_b2bua::{AckOr2xxHandler, B2bHandler, B2buaManager, HandlerRegistry};
use sigcore_sip::SipMessage;
use sigcore_transport::multiplexer::{bind_in_range, ListenerCounts};
use sigcore_transport::tls::TlsSettings;
use sigcore_transport::{Protocol, RateLimitConfig, RateLimiter, TcpTransport, Transport, TransportEvent, UdpTransport, WebSocketTransport};
use sigcore_transaction::{TimerSettings, TransactionKey, TransactionManager, TransactionUser};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

use crate::config::{StackConfig, TlsConfig};
use crate::error::{Error, Result};
use crate::worker::WorkerPool;

/// Invoked with every response a `send_request` call receives, including
/// provisional ones; the transaction layer keeps delivering until it
/// terminates.
#[async_trait]
pub trait ResponseCallback: Send + Sync {
    async fn on_response(&self, response: SipMessage);
}

/// Invoked once when the ad hoc client transaction above terminates
/// (final response relayed, or a synthesized timeout/transport-failure
/// response delivered).
#[async_trait]
pub trait TerminateCallback: Send + Sync {
    async fn on_terminate(&self);
}

#[derive(Clone)]
struct PendingCall {
    response_cb: Arc<dyn ResponseCallback>,
    terminate_cb: Option<Arc<dyn TerminateCallback>>,
}

/// Which protocols are currently enabled for binding. Mirrors the
/// per-interface `*_enabled` flags in [`crate::config::InterfaceConfig`]
/// but can be flipped at runtime before `transport_init` runs.
#[derive(Debug, Clone, Copy, Default)]
struct EnabledProtocols {
    udp: bool,
    tcp: bool,
    tls: bool,
    ws: bool,
}

/// `bases`/`maxes` for [`SipStack::transport_init_range`]: only TCP and
/// WS are ephemeral-port ranges in the source configuration (§6 names
/// `sip-tcp-port-{base,max}` and `sip-ws-port-{base,max}`; UDP and TLS
/// bind their configured fixed ports instead).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolPorts {
    pub tcp: Option<u16>,
    pub ws: Option<u16>,
}

/// The signalling core's single entry point. Holds the transport
/// listeners, lazily spawns the transaction layer the first time it's
/// needed (two-phase construction, same pattern as
/// [`B2buaManager::attach_transactions`]), and owns the handler
/// registry and B2BUA manager underneath it.
pub struct SipStack {
    config: RwLock<StackConfig>,
    enabled: RwLock<EnabledProtocols>,
    udp_listeners: RwLock<Vec<SocketAddr>>,
    tcp_listeners: RwLock<Vec<SocketAddr>>,
    tls_listeners: RwLock<Vec<SocketAddr>>,
    ws_listeners: RwLock<Vec<SocketAddr>>,
    tls_settings: RwLock<Option<TlsSettings>>,
    rate_limiter: RwLock<Option<Arc<RateLimiter>>>,
    null_route_hook: RwLock<Option<sigcore_transport::NullRouteHook>>,
    transports: DashMap<Protocol, Arc<dyn Transport>>,
    timers: TimerSettings,
    transactions: OnceCell<Arc<TransactionManager>>,
    registry: Arc<HandlerRegistry>,
    b2bua: Arc<B2buaManager>,
    pending_calls: DashMap<TransactionKey, PendingCall>,
    workers: WorkerPool,
    running: RwLock<bool>,
    /// A handle back to this stack's own `Arc`, so the [`TransactionUser`]
    /// impl below can move an owned reference into a task spawned on
    /// [`WorkerPool::spawn`] instead of running the callback inline on
    /// the transport's receive loop (§5: "transport I/O is never blocked
    /// by user code").
    self_ref: Weak<SipStack>,
}

impl SipStack {
    pub fn new(config: StackConfig) -> Arc<Self> {
        let registry = Arc::new(HandlerRegistry::new());
        let b2bua = B2buaManager::new(registry.clone());
        let workers = WorkerPool::new(config.worker_pool_min, config.worker_pool_max);
        Arc::new_cyclic(|self_ref| SipStack {
            config: RwLock::new(config),
            enabled: RwLock::new(EnabledProtocols::default()),
            udp_listeners: RwLock::new(Vec::new()),
            tcp_listeners: RwLock::new(Vec::new()),
            tls_listeners: RwLock::new(Vec::new()),
            ws_listeners: RwLock::new(Vec::new()),
            tls_settings: RwLock::new(None),
            rate_limiter: RwLock::new(None),
            null_route_hook: RwLock::new(None),
            transports: DashMap::new(),
            timers: TimerSettings::default(),
            transactions: OnceCell::new(),
            registry,
            b2bua,
            pending_calls: DashMap::new(),
            workers,
            running: RwLock::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub async fn enable_udp(&self, enabled: bool) {
        self.enabled.write().await.udp = enabled;
    }

    pub async fn enable_tcp(&self, enabled: bool) {
        self.enabled.write().await.tcp = enabled;
    }

    pub async fn enable_tls(&self, enabled: bool) {
        self.enabled.write().await.tls = enabled;
    }

    pub async fn enable_ws(&self, enabled: bool) {
        self.enabled.write().await.ws = enabled;
    }

    pub fn udp_listeners(&self) -> &RwLock<Vec<SocketAddr>> {
        &self.udp_listeners
    }

    pub fn tcp_listeners(&self) -> &RwLock<Vec<SocketAddr>> {
        &self.tcp_listeners
    }

    pub fn tls_listeners(&self) -> &RwLock<Vec<SocketAddr>> {
        &self.tls_listeners
    }

    pub fn ws_listeners(&self) -> &RwLock<Vec<SocketAddr>> {
        &self.ws_listeners
    }

    /// Registers the certificate/key material a TLS listener binds
    /// against. Must be called before `transport_init` if any interface
    /// has `tls_enabled` set.
    pub async fn initialize_tls_context(&self, tls: &TlsConfig) {
        *self.tls_settings.write().await = Some(TlsSettings {
            ca_file: tls.ca_file.clone(),
            ca_path: tls.ca_path.clone(),
            certificate_file: tls.certificate_file.clone(),
            private_key_file: tls.private_key_file.clone(),
            verify_peer: tls.verify_peer,
        });
    }

    /// Overrides `listeners.packet-rate-ratio` (and its whitelist) after
    /// construction, e.g. to apply an operator override read from
    /// somewhere other than the config file. Takes effect for any
    /// transport bound afterward; already-bound listeners keep whatever
    /// limiter they started with.
    pub async fn set_transport_threshold(&self, spec: &str) -> Result<()> {
        let mut rl_config = RateLimitConfig::parse(spec).ok_or_else(|| Error::Config(format!("invalid packet-rate-ratio: {spec}")))?;
        let config = self.config.read().await;
        rl_config.auto_null_route_on_ban = config.listeners.auto_null_route_on_ban;
        for entry in &config.listeners.packet_rate_white_list {
            match parse_whitelist_entry(&entry.0) {
                Some(net) => rl_config.whitelist.push(net),
                None => warn!(entry = %entry.0, "ignoring unparseable packet-rate-white-list entry"),
            }
        }
        drop(config);
        let mut limiter = RateLimiter::new(rl_config);
        if let Some(hook) = self.null_route_hook.read().await.clone() {
            limiter = limiter.with_null_route_hook(hook);
        }
        *self.rate_limiter.write().await = Some(Arc::new(limiter));
        Ok(())
    }

    /// Installs the `null_route(ip)` hook (§4.3) invoked when a source is
    /// banned and `listeners.auto-null-route-on-ban` is set. Must be
    /// called before [`Self::set_transport_threshold`] to take effect on
    /// the limiter it builds.
    pub async fn set_null_route_hook(&self, hook: sigcore_transport::NullRouteHook) {
        *self.null_route_hook.write().await = Some(hook);
    }

    pub fn set_request_handler(&self, handler: Arc<dyn B2bHandler>) {
        self.registry.register_handler(handler);
    }

    pub async fn set_ack_or_2xx_handler(&self, handler: Arc<dyn AckOr2xxHandler>) {
        self.b2bua.set_ack_or_2xx_handler(handler).await;
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn b2bua(&self) -> &Arc<B2buaManager> {
        &self.b2bua
    }

    async fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.rate_limiter.read().await.clone()
    }

    /// Lazily spawns the transaction layer, binding it to this stack as
    /// its [`TransactionUser`] and attaching it to the B2BUA manager —
    /// both only happen once, the first time a transport is adopted.
    async fn ensure_transactions(self: &Arc<Self>) -> Arc<TransactionManager> {
        let this = self.clone();
        self.transactions
            .get_or_init(|| async move {
                let user: Arc<dyn TransactionUser> = this.clone();
                let manager = TransactionManager::spawn(this.timers, user);
                manager.set_use_source_address_for_responses(this.config.read().await.listeners.use_source_address_for_responses);
                this.b2bua.attach_transactions(manager.clone());
                manager
            })
            .await
            .clone()
    }

    async fn adopt(self: &Arc<Self>, transport: Arc<dyn Transport>, mut events: tokio::sync::mpsc::Receiver<TransportEvent>) {
        let transactions = self.ensure_transactions().await;
        transactions.register_transport(transport.clone());
        self.transports.insert(transport.protocol(), transport);

        let transactions = transactions.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                transactions.handle_inbound(event).await;
            }
        });
    }

    async fn bind_fixed(self: &Arc<Self>, protocol: Protocol, addr: SocketAddr) -> Result<SocketAddr> {
        let limiter = self.rate_limiter().await;
        let bound = match protocol {
            Protocol::Udp => {
                let (transport, events) = UdpTransport::bind(addr, limiter, None).await?;
                let local = transport.local_addr()?;
                self.adopt(Arc::new(transport), events).await;
                local
            }
            Protocol::Tcp => {
                let (transport, events) = TcpTransport::bind(addr, limiter, None).await?;
                let local = transport.local_addr()?;
                self.adopt(Arc::new(transport), events).await;
                local
            }
            Protocol::Ws => {
                let (transport, events) = WebSocketTransport::bind(addr, limiter, None).await?;
                let local = transport.local_addr()?;
                self.adopt(Arc::new(transport), events).await;
                local
            }
            Protocol::Tls => {
                let settings = self
                    .tls_settings
                    .read()
                    .await
                    .clone()
                    .ok_or_else(|| Error::Config("initialize_tls_context must be called before binding a TLS listener".into()))?;
                let server_config = sigcore_transport::tls::server_config(&settings)?;
                let client_config = sigcore_transport::tls::client_config(&settings)?;
                let (transport, events) = sigcore_transport::TlsTransport::bind(addr, server_config, client_config, limiter, None).await?;
                let local = transport.local_addr()?;
                self.adopt(Arc::new(transport), events).await;
                local
            }
        };
        Ok(bound)
    }

    /// Binds one listener per enabled protocol on every configured
    /// interface at its configured fixed port (§4.5 / §6).
    pub async fn transport_init(self: &Arc<Self>) -> Result<()> {
        let config = self.config.read().await.clone();
        let enabled = *self.enabled.read().await;

        for iface in &config.listeners.interfaces {
            let Some(ip) = iface.resolved_ip() else {
                warn!(ip = %iface.ip_address, "skipping interface with unresolved \"auto\" address");
                continue;
            };

            if enabled.udp && iface.udp_enabled {
                let addr = self.bind_fixed(Protocol::Udp, SocketAddr::new(ip, iface.sip_port)).await?;
                self.udp_listeners.write().await.push(addr);
            }
            if enabled.tcp && iface.tcp_enabled {
                let addr = self.bind_fixed(Protocol::Tcp, SocketAddr::new(ip, iface.sip_port)).await?;
                self.tcp_listeners.write().await.push(addr);
            }
            if enabled.ws && iface.ws_enabled {
                let addr = self.bind_fixed(Protocol::Ws, SocketAddr::new(ip, iface.ws_port)).await?;
                self.ws_listeners.write().await.push(addr);
            }
            if enabled.tls && iface.tls_enabled {
                let addr = self.bind_fixed(Protocol::Tls, SocketAddr::new(ip, iface.tls_port)).await?;
                self.tls_listeners.write().await.push(addr);
            }
        }
        Ok(())
    }

    /// Binds TCP/WS listeners by walking `[base, max]` until a free port
    /// is found on each enabled interface, instead of the fixed ports in
    /// the config (the ephemeral ranges named by `transport_init_range`
    /// in §4.5). UDP and TLS are unaffected; call `transport_init` for
    /// those.
    pub async fn transport_init_range(self: &Arc<Self>, bases: ProtocolPorts, maxes: ProtocolPorts) -> Result<()> {
        let config = self.config.read().await.clone();
        let enabled = *self.enabled.read().await;
        let limiter = self.rate_limiter().await;

        for iface in &config.listeners.interfaces {
            let Some(ip) = iface.resolved_ip() else { continue };

            if enabled.tcp && iface.tcp_enabled {
                if let (Some(base), Some(max)) = (bases.tcp, maxes.tcp) {
                    let limiter = limiter.clone();
                    let (transport, events) =
                        bind_in_range(ip, base, max, "TCP", move |addr| TcpTransport::bind(addr, limiter.clone(), None)).await?;
                    let local = transport.local_addr()?;
                    self.adopt(Arc::new(transport), events).await;
                    self.tcp_listeners.write().await.push(local);
                }
            }
            if enabled.ws && iface.ws_enabled {
                if let (Some(base), Some(max)) = (bases.ws, maxes.ws) {
                    let limiter = limiter.clone();
                    let (transport, events) =
                        bind_in_range(ip, base, max, "WS", move |addr| WebSocketTransport::bind(addr, limiter.clone(), None)).await?;
                    let local = transport.local_addr()?;
                    self.adopt(Arc::new(transport), events).await;
                    self.ws_listeners.write().await.push(local);
                }
            }
        }
        Ok(())
    }

    /// Starts the stack: binds whatever `transport_init`/
    /// `transport_init_range` hasn't already bound, then marks the stack
    /// running. Idempotent — a second call with listeners already up is
    /// a no-op beyond the fixed-port pass (`transport_init` itself skips
    /// nothing, so call it at most once per process if ports must stay
    /// stable).
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if self.transports.is_empty() {
            self.transport_init().await?;
        }
        if self.transports.is_empty() {
            return Err(Error::NoListener("no protocol bound any listener"));
        }

        let counts = self.listener_counts().await;
        let tls_requested = {
            let enabled = *self.enabled.read().await;
            enabled.tls && self.config.read().await.listeners.interfaces.iter().any(|iface| iface.tls_enabled)
        };
        if tls_requested && !counts.has_tls() {
            warn!("TLS enabled in configuration but no TLS listener ended up bound; TLS capability unavailable for this run");
        }

        *self.running.write().await = true;
        Ok(())
    }

    /// The number of bound listeners per protocol — the per-protocol
    /// capability view named in §4.3's `transport_init_range`. Used by
    /// [`Self::run`] to decide whether TLS is actually available rather
    /// than merely configured; this is the corrected `hasTLS` check
    /// (`ListenerCounts::has_tls`) rather than the source's
    /// copy-pasted TCP-listener-count check.
    pub async fn listener_counts(&self) -> ListenerCounts {
        ListenerCounts {
            udp: self.udp_listeners.read().await.len(),
            tcp: self.tcp_listeners.read().await.len(),
            tls: self.tls_listeners.read().await.len(),
            ws: self.ws_listeners.read().await.len(),
        }
    }

    /// Stops accepting new work: closes every transport and the worker
    /// pool, and marks the stack not running. In-flight callbacks finish.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.workers.close();
        for entry in self.transports.iter() {
            if let Err(err) = entry.value().close().await {
                warn!(protocol = %entry.key(), %err, "error closing transport during stop");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Creates a bare client transaction without any ad hoc response
    /// tracking — used by B2BUA-internal routing, or by callers that
    /// only care that the request was sent, not what answers it.
    pub async fn create_client_transaction(self: &Arc<Self>, request: SipMessage, destination: SocketAddr, protocol: Protocol) -> Result<TransactionKey> {
        if !self.is_running().await {
            return Err(Error::NotRunning);
        }
        let transactions = self.ensure_transactions().await;
        Ok(transactions.create_client_transaction(request, destination, protocol).await?)
    }

    /// Sends `request` as a standalone client transaction (e.g. REGISTER,
    /// or an out-of-dialog OPTIONS keepalive) and tracks `cb`/`term_cb`
    /// against its key so responses route back here instead of through
    /// the B2BUA pairing tables. `local` is accepted for parity with the
    /// source's per-listener dispatch but unused: one transport per
    /// protocol is registered with the transaction layer regardless of
    /// which local interface accepted the original request.
    pub async fn send_request(
        self: &Arc<Self>,
        request: SipMessage,
        local: SocketAddr,
        destination: SocketAddr,
        protocol: Protocol,
        cb: Arc<dyn ResponseCallback>,
        term_cb: Option<Arc<dyn TerminateCallback>>,
    ) -> Result<TransactionKey> {
        let _ = local;
        let key = self.create_client_transaction(request, destination, protocol).await?;
        self.pending_calls.insert(key.clone(), PendingCall { response_cb: cb, terminate_cb: term_cb });
        Ok(key)
    }

    /// Sends `request` directly on the bound transport for `protocol`,
    /// bypassing the transaction layer entirely — no retransmission, no
    /// correlation of whatever comes back.
    pub async fn send_request_direct(&self, request: &SipMessage, local: SocketAddr, destination: SocketAddr, protocol: Protocol) -> Result<()> {
        let _ = local;
        let transport = self.transports.get(&protocol).map(|t| t.clone()).ok_or(Error::NoListener(protocol.as_str()))?;
        transport.send(request, destination).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionUser for SipStack {
    /// Hands the callback to the worker pool and returns immediately —
    /// this method runs on the per-transport receive loop (`adopt`), and
    /// §5 requires that loop never block on user code. `self_ref` lets
    /// the spawned task hold its own `Arc<SipStack>` rather than
    /// borrowing `&self`.
    async fn on_new_server_transaction(&self, key: TransactionKey, request: Box<SipMessage>, source: SocketAddr) {
        let Some(this) = self.self_ref.upgrade() else {
            debug!("stack dropped before its server transaction callback could be scheduled");
            return;
        };
        self.workers.spawn(async move {
            this.b2bua.on_new_server_transaction(key, request, source).await;
        });
    }

    async fn on_response(&self, key: TransactionKey, response: Box<SipMessage>) {
        let Some(this) = self.self_ref.upgrade() else {
            debug!("stack dropped before its response callback could be scheduled");
            return;
        };
        self.workers.spawn(async move {
            let Some(pending) = this.pending_calls.get(&key).map(|e| e.clone()) else {
                this.b2bua.on_response(key, response).await;
                return;
            };

            let is_final = response.status().map(|s| s.is_final()).unwrap_or(true);
            pending.response_cb.on_response((*response).clone()).await;

            if is_final {
                this.pending_calls.remove(&key);
                if let Some(term_cb) = pending.terminate_cb {
                    term_cb.on_terminate().await;
                }
            }
        });
    }

    async fn on_ack_or_2xx(&self, request: Box<SipMessage>, source: SocketAddr) {
        let Some(this) = self.self_ref.upgrade() else {
            debug!("stack dropped before its ACK/2xx callback could be scheduled");
            return;
        };
        self.workers.spawn(async move {
            this.b2bua.on_ack_or_2xx(request, source).await;
        });
    }
}

fn parse_whitelist_entry(entry: &str) -> Option<ipnet::IpNet> {
    if entry.contains('/') {
        entry.parse().ok()
    } else {
        let ip: IpAddr = entry.parse().ok()?;
        match ip {
            IpAddr::V4(v4) => Some(ipnet::IpNet::V4(ipnet::Ipv4Net::new(v4, 32).ok()?)),
            IpAddr::V6(v6) => Some(ipnet::IpNet::V6(ipnet::Ipv6Net::new(v6, 128).ok()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn null_route_hook_fires_through_the_installed_limiter() {
        let mut config = StackConfig::default();
        config.listeners.packet_rate_ratio = Some("5/500/60".to_string());
        config.listeners.auto_null_route_on_ban = true;
        let stack = SipStack::new(config);

        let banned = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = banned.clone();
        stack.set_null_route_hook(Arc::new(move |ip| recorded.lock().unwrap().push(ip))).await;
        stack.set_transport_threshold("5/500/60").await.unwrap();

        let limiter = stack.rate_limiter().await.expect("limiter installed");
        let source: IpAddr = "10.0.0.9".parse().unwrap();
        for _ in 0..20 {
            limiter.admit(source);
        }
        assert_eq!(banned.lock().unwrap().as_slice(), &[source]);
    }

    #[tokio::test]
    async fn run_without_any_enabled_protocol_reports_no_listener() {
        let stack = SipStack::new(StackConfig::default());
        let err = stack.run().await.unwrap_err();
        assert!(matches!(err, Error::NoListener(_)));
    }

    #[tokio::test]
    async fn binds_a_udp_listener_and_reports_it() {
        let mut config = StackConfig::default();
        config.listeners.interfaces.push(crate::config::InterfaceConfig {
            ip_address: "127.0.0.1".to_string(),
            external_address: None,
            sip_port: 0,
            tls_port: 0,
            ws_port: 0,
            udp_enabled: true,
            tcp_enabled: false,
            ws_enabled: false,
            tls_enabled: false,
            subnets: Vec::new(),
            default: true,
        });
        let stack = SipStack::new(config);
        stack.enable_udp(true).await;
        stack.run().await.unwrap();
        assert_eq!(stack.udp_listeners().read().await.len(), 1);
        assert!(stack.is_running().await);
    }

    #[tokio::test]
    async fn listener_counts_reports_tls_by_its_own_listener_vector() {
        let mut config = StackConfig::default();
        config.listeners.interfaces.push(crate::config::InterfaceConfig {
            ip_address: "127.0.0.1".to_string(),
            external_address: None,
            sip_port: 0,
            tls_port: 0,
            ws_port: 0,
            udp_enabled: false,
            tcp_enabled: true,
            ws_enabled: false,
            tls_enabled: false,
            subnets: Vec::new(),
            default: true,
        });
        let stack = SipStack::new(config);
        stack.enable_tcp(true).await;
        stack.run().await.unwrap();

        let counts = stack.listener_counts().await;
        assert_eq!(counts.tcp, 1);
        assert!(!counts.has_tls(), "a TCP listener must not be mistaken for a TLS one");
    }

    struct RecordingCallback {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ResponseCallback for RecordingCallback {
        async fn on_response(&self, _response: SipMessage) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn send_request_without_a_live_listener_for_the_protocol_fails() {
        let stack = SipStack::new(StackConfig::default());
        stack.run().await.ok();
        let count = Arc::new(AtomicUsize::new(0));
        let cb = Arc::new(RecordingCallback { count: count.clone() });
        let mut request = SipMessage::request(sigcore_sip::Method::Options, sigcore_sip::SipUri::sip("example.com"));
        request.headers.append("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-test");
        request.headers.append("Call-ID", "c1");
        request.headers.append("CSeq", "1 OPTIONS");
        let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let dest: SocketAddr = "127.0.0.1:5061".parse().unwrap();
        let result = stack.send_request(request, local, dest, Protocol::Udp, cb, None).await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    /// §5: transaction-user callbacks run on the worker pool, not inline
    /// on whatever task delivered the event. `on_response` must return
    /// before the pending callback necessarily runs.
    #[tokio::test]
    async fn on_response_runs_on_the_worker_pool_not_inline() {
        let stack = SipStack::new(StackConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let cb = Arc::new(RecordingCallback { count: count.clone() });
        let key = TransactionKey::new("z9hG4bK-worker-test", sigcore_sip::Method::Options, false);
        stack.pending_calls.insert(key.clone(), PendingCall { response_cb: cb, terminate_cb: None });

        let mut response = SipMessage::response(sigcore_sip::types::status::OK, "OK");
        response.headers.append("Call-ID", "c1");
        TransactionUser::on_response(&*stack, key.clone(), Box::new(response)).await;

        // The dispatch above only schedules the callback; it must not have
        // run synchronously inline with this call.
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(stack.pending_calls.get(&key).is_none(), "final response must clear the pending call entry");
    }
}
