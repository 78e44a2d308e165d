//! SIP transport multiplexer for the signalling core: UDP, TCP, TLS, and
//! WebSocket listeners behind a common [`Transport`] trait, with per-peer
//! rate limiting and stream connection reuse.

pub mod error;
pub mod event;
pub mod multiplexer;
pub mod ratelimit;
pub mod transport;
pub mod udp;
pub mod via;

#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
#[cfg(feature = "ws")]
pub mod ws;

pub use error::{Error, Result};
pub use event::{Protocol, TransportEvent};
pub use ratelimit::{NullRouteHook, RateLimitConfig, RateLimiter};
pub use transport::Transport;
pub use udp::UdpTransport;
pub use via::{parse_sent_by, resolve_response_target, stamp_received_and_rport, ViaSentBy};

#[cfg(feature = "tcp")]
pub use tcp::TcpTransport;
#[cfg(feature = "tls")]
pub use tls::TlsTransport;
#[cfg(feature = "ws")]
pub use ws::WebSocketTransport;

pub mod prelude {
    pub use crate::{
        resolve_response_target, stamp_received_and_rport, Error, Protocol, RateLimitConfig, RateLimiter, Result, Transport, TransportEvent,
        UdpTransport, ViaSentBy,
    };

    #[cfg(feature = "tcp")]
    pub use crate::TcpTransport;
    #[cfg(feature = "tls")]
    pub use crate::TlsTransport;
    #[cfg(feature = "ws")]
    pub use crate::WebSocketTransport;
}
