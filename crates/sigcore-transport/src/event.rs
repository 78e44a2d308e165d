use std::net::SocketAddr;

use sigcore_sip::SipMessage;

/// Protocol a message arrived on or should be sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl Protocol {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Protocol::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Ws => "WS",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events flowing out of a transport's receive loop, funneled to whoever
/// owns the transaction layer.
#[derive(Debug)]
pub enum TransportEvent {
    MessageReceived { message: Box<SipMessage>, source: SocketAddr, local: SocketAddr, protocol: Protocol },
    ParseError { raw: bytes::Bytes, source: SocketAddr, protocol: Protocol, error: String },
    Closed { local: SocketAddr, protocol: Protocol },
}
