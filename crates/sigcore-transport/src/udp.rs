use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sigcore_sip::SipMessage;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::{Protocol, TransportEvent};
use crate::ratelimit::RateLimiter;
use crate::transport::{encode_message, Transport};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
/// Datagrams above this size risk IP fragmentation; we still send them
/// (SIP over UDP tolerates fragmentation) but log at debug level.
const MTU_SAFE_SIZE: usize = 1300;

/// UDP transport for SIP messages. One socket, shared between the
/// receive loop and any number of senders via a cloned handle.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    socket: UdpSocket,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl UdpTransport {
    pub async fn bind(
        addr: SocketAddr,
        rate_limiter: Option<Arc<RateLimiter>>,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| Error::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY));

        let transport = UdpTransport {
            inner: Arc::new(Inner { socket, closed: AtomicBool::new(false), events_tx, rate_limiter }),
        };
        debug!(%local_addr, "UDP transport bound");
        transport.spawn_receive_loop();
        Ok((transport, events_rx))
    }

    fn spawn_receive_loop(&self) {
        let transport = self.clone();
        tokio::spawn(async move {
            let inner = &transport.inner;
            let local = inner.socket.local_addr().ok();
            let mut buf = vec![0u8; 65536];
            while !inner.closed.load(Ordering::Relaxed) {
                let (len, source) = match inner.socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!(error = %e, "UDP recv_from failed");
                        continue;
                    }
                };

                if let Some(limiter) = &inner.rate_limiter {
                    if !limiter.admit(source.ip()) {
                        continue;
                    }
                }

                let packet = &buf[..len];
                match sigcore_sip::parser::parse(packet) {
                    Ok(message) => {
                        let Some(local) = local else { continue };
                        let event = TransportEvent::MessageReceived {
                            message: Box::new(message),
                            source,
                            local,
                            protocol: Protocol::Udp,
                        };
                        if inner.events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%source, error = %e, "dropping unparseable UDP packet");
                        let event = TransportEvent::ParseError {
                            raw: bytes::Bytes::copy_from_slice(packet),
                            source,
                            protocol: Protocol::Udp,
                            error: e.to_string(),
                        };
                        let _ = inner.events_tx.send(event).await;
                    }
                }
            }
            if let Some(local) = local {
                let _ = inner.events_tx.send(TransportEvent::Closed { local, protocol: Protocol::Udp }).await;
            }
        });
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let bytes = encode_message(message);
        if bytes.len() > MTU_SAFE_SIZE {
            debug!(len = bytes.len(), %destination, "sending fragmentation-risk datagram above MTU-safe size");
        }
        self.inner.socket.send_to(&bytes, destination).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "UdpTransport({addr})"),
            Err(_) => write!(f, "UdpTransport(<closed>)"),
        }
    }
}
