use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bind failed on {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, #[source] source: std::io::Error },

    #[error("no listener configured for {protocol} after exhausting the port range")]
    NoListener { protocol: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("unknown peer for connection reuse: {0}")]
    UnknownPeer(std::net::SocketAddr),

    #[error("rate limited: {0}")]
    RateLimited(std::net::IpAddr),

    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(String),

    #[cfg(feature = "ws")]
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("message parse error: {0}")]
    Parse(#[from] sigcore_sip::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
