//! Port-range binding and the aggregate view over a stack's listeners.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Walks `[base, max]` trying `attempt` at each port until one binds, or
/// returns [`Error::NoListener`] once the range is exhausted. Mirrors
/// `transport_init_range`'s ephemeral-port search for the TCP/WS bind
/// ranges named in the stack configuration.
pub async fn bind_in_range<T, F, Fut>(
    ip: IpAddr,
    base: u16,
    max: u16,
    protocol: &'static str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut port = base;
    loop {
        match attempt(SocketAddr::new(ip, port)).await {
            Ok(bound) => return Ok(bound),
            Err(Error::Bind { .. }) if port < max => port += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Listener counts across the four protocols, used to decide whether a
/// capability (such as TLS) is present. The source computes this
/// `hasTLS` flag as `tcpListeners.size() > 0` — a copy-paste bug from the
/// TCP branch — so this corrected version counts the TLS listener vector
/// instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerCounts {
    pub udp: usize,
    pub tcp: usize,
    pub tls: usize,
    pub ws: usize,
}

impl ListenerCounts {
    pub fn has_tls(&self) -> bool {
        self.tls > 0
    }
}
