//! The DNS resolver boundary (§6): maps a host to a list of candidate
//! addresses. The core never resolves names itself — routing decisions
//! hand back a concrete `SocketAddr` already — but upper-layer handlers
//! that implement `on_route_transaction` need somewhere to look hosts up.

use std::net::SocketAddr;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("could not resolve host {host}: {reason}")]
    NotFound { host: String, reason: String },
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, default_port: u16) -> Result<Vec<SocketAddr>, ResolveError>;
}
