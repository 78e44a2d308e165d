//! TCP transport with connection reuse: outbound writes look up an
//! existing session keyed by `(remote_ip, remote_port)` before dialing a
//! new one, and inbound connections are read with the streaming parser
//! so a response can be written back on the socket it arrived on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sigcore_sip::parser::{Consumed, StreamParser};
use sigcore_sip::SipMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::{Protocol, TransportEvent};
use crate::ratelimit::RateLimiter;
use crate::transport::{encode_message, Transport};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct Connection {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
    rate_limiter: Option<Arc<RateLimiter>>,
    sessions: DashMap<SocketAddr, Arc<Connection>>,
}

impl TcpTransport {
    pub async fn bind(
        addr: SocketAddr,
        rate_limiter: Option<Arc<RateLimiter>>,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY));

        let transport = TcpTransport {
            inner: Arc::new(Inner {
                local_addr,
                closed: AtomicBool::new(false),
                events_tx,
                rate_limiter,
                sessions: DashMap::new(),
            }),
        };
        debug!(%local_addr, "TCP transport bound");
        transport.spawn_accept_loop(listener);
        Ok((transport, events_rx))
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                if transport.inner.closed.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Some(limiter) = &transport.inner.rate_limiter {
                            if !limiter.admit(peer.ip()) {
                                continue;
                            }
                        }
                        transport.adopt_stream(stream, peer);
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                    }
                }
            }
        });
    }

    /// Registers `stream` for `peer` in the reuse table and spawns its
    /// read loop, whether it was accepted or dialed outbound.
    fn adopt_stream(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        self.inner.sessions.insert(peer, Arc::new(Connection { writer: Mutex::new(writer) }));

        let inner = self.inner.clone();
        tokio::spawn(async move {
            read_loop(inner.clone(), reader, peer).await;
            inner.sessions.remove(&peer);
            let _ = inner
                .events_tx
                .send(TransportEvent::Closed { local: inner.local_addr, protocol: Protocol::Tcp })
                .await;
        });
    }

    async fn connection_for(&self, destination: SocketAddr) -> Result<Arc<Connection>> {
        if let Some(conn) = self.inner.sessions.get(&destination) {
            return Ok(conn.clone());
        }
        let stream = TcpStream::connect(destination).await?;
        self.adopt_stream(stream, destination);
        self.inner
            .sessions
            .get(&destination)
            .map(|c| c.clone())
            .ok_or(Error::UnknownPeer(destination))
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: tokio::net::tcp::OwnedReadHalf, peer: SocketAddr) {
    let mut parser = StreamParser::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(%peer, error = %e, "TCP read failed");
                break;
            }
        };

        let mut offset = 0;
        while offset < n {
            match parser.feed(&buf[offset..n]) {
                Ok(Consumed::NeedMore) => break,
                Ok(Consumed::Done { message, consumed }) => {
                    offset += consumed;
                    let event = TransportEvent::MessageReceived {
                        message,
                        source: peer,
                        local: inner.local_addr,
                        protocol: Protocol::Tcp,
                    };
                    if inner.events_tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "TCP stream parse error, dropping connection");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let bytes = encode_message(message);
        let conn = self.connection_for(destination).await?;
        let mut writer = conn.writer.lock().await;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.sessions.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpTransport({})", self.inner.local_addr)
    }
}
