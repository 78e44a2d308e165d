//! WebSocket transport (RFC 7118): one SIP message per text frame.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use sigcore_sip::SipMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, client_async, WebSocketStream};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::{Protocol, TransportEvent};
use crate::ratelimit::RateLimiter;
use crate::transport::{encode_message, Transport};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>;

struct Connection {
    sink: Mutex<WsSink>,
}

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
    rate_limiter: Option<Arc<RateLimiter>>,
    sessions: DashMap<SocketAddr, Arc<Connection>>,
}

impl WebSocketTransport {
    pub async fn bind(
        addr: SocketAddr,
        rate_limiter: Option<Arc<RateLimiter>>,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY));

        let transport = WebSocketTransport {
            inner: Arc::new(Inner {
                local_addr,
                closed: AtomicBool::new(false),
                events_tx,
                rate_limiter,
                sessions: DashMap::new(),
            }),
        };
        debug!(%local_addr, "WebSocket transport bound");
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
                        let inner = transport.inner.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => adopt_stream(inner, ws, peer).await,
                                Err(e) => warn!(%peer, error = %e, "WebSocket handshake failed"),
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "WebSocket accept failed"),
                }
            }
        });
    }

    async fn connection_for(&self, destination: SocketAddr) -> Result<Arc<Connection>> {
        if let Some(conn) = self.inner.sessions.get(&destination) {
            return Ok(conn.clone());
        }
        let url = format!("ws://{destination}/");
        let tcp = TcpStream::connect(destination).await?;
        let (ws, _response) =
            client_async(&url, tcp).await.map_err(|e| Error::WebSocket(e.to_string()))?;
        adopt_stream(self.inner.clone(), ws, destination).await;
        self.inner.sessions.get(&destination).map(|c| c.clone()).ok_or(Error::UnknownPeer(destination))
    }
}

async fn adopt_stream(inner: Arc<Inner>, ws: WebSocketStream<TcpStream>, peer: SocketAddr) {
    let (sink, mut stream) = ws.split();
    inner.sessions.insert(peer, Arc::new(Connection { sink: Mutex::new(sink) }));

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match sigcore_sip::parser::parse(text.as_bytes()) {
                    Ok(message) => {
                        let event = TransportEvent::MessageReceived {
                            message: Box::new(message),
                            source: peer,
                            local: inner.local_addr,
                            protocol: Protocol::Ws,
                        };
                        if inner.events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping unparseable WebSocket frame");
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(%peer, error = %e, "WebSocket read failed");
                    break;
                }
            }
        }
        inner.sessions.remove(&peer);
        let _ = inner.events_tx.send(TransportEvent::Closed { local: inner.local_addr, protocol: Protocol::Ws }).await;
    });
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let bytes = encode_message(message);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let conn = self.connection_for(destination).await?;
        let mut sink = conn.sink.lock().await;
        sink.send(WsMessage::Text(text)).await.map_err(|e| Error::WebSocket(e.to_string()))?;
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

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebSocketTransport({})", self.inner.local_addr)
    }
}
