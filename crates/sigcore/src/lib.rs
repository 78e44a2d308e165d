//! # sigcore
//!
//! The signalling core's facade: one [`SipStack`] wiring transport
//! listeners ([`sigcore_transport`]), the RFC 3261 transaction layer
//! ([`sigcore_transaction`]), and the B2BUA pipeline ([`sigcore_b2bua`])
//! behind a single entry point, plus the typed configuration shape
//! (`config`) and the external-system boundaries (`kvstore`, `resolver`)
//! a deployment plugs its own backends into.
//!
//! ```no_run
//! use sigcore::{SipStack, StackConfig};
//!
//! # async fn run() -> sigcore::Result<()> {
//! let config = StackConfig::default();
//! let stack = SipStack::new(config);
//! stack.enable_udp(true).await;
//! stack.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod kvstore;
pub mod resolver;
pub mod stack;
pub mod worker;

pub use config::StackConfig;
pub use error::{Error, Result};
pub use kvstore::{KVStore, KvError};
pub use resolver::{ResolveError, Resolver};
pub use stack::{ProtocolPorts, ResponseCallback, SipStack, TerminateCallback};
pub use worker::WorkerPool;

pub use sigcore_b2bua::{B2bHandler, HandlerRegistry, MessageType, RouteDecision, UserAgentHandler};
pub use sigcore_sip::{Method, SipMessage, SipUri, StatusCode};
pub use sigcore_transport::Protocol;
