//! Back-to-back user agent transaction manager: the handler registry and
//! the ingress/egress pipeline described in §4.4, sitting on top of
//! `sigcore-transaction`.
//!
//! A [`B2buaManager`] is the [`sigcore_transaction::TransactionUser`] a
//! [`sigcore_transaction::TransactionManager`] is spawned with. It never
//! talks to a transport directly — the transaction layer already owns
//! that — it only decides, per inbound server transaction, whether to
//! hijack it, challenge it, route it, or answer it locally, and pairs it
//! with an outbound client transaction when routing succeeds.

pub mod error;
pub mod handler;
pub mod manager;
pub mod registry;

pub use error::{Error, Result};
pub use handler::{B2bHandler, MessageType, RouteDecision, UserAgentHandler};
pub use manager::{AckOr2xxHandler, B2buaManager, ExternalDispatch, PostRouteHook};
pub use registry::HandlerRegistry;
