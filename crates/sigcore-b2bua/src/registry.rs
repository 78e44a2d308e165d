//! Handler lookup: domain routers take priority over the method
//! registry, which falls back to a default handler if one is installed.
//!
//! Per §5's concurrency model, registries are mutated only during
//! initialization and read-only once `run()` has been called; a
//! `DashMap` gives lock-free reads without requiring callers to
//! coordinate that discipline themselves.

use std::sync::Arc;

use dashmap::DashMap;
use sigcore_sip::SipMessage;
use tokio::sync::RwLock;

use crate::handler::{B2bHandler, MessageType, UserAgentHandler};

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<MessageType, Arc<dyn B2bHandler>>,
    domain_routers: DashMap<String, Arc<dyn B2bHandler>>,
    user_agent_handlers: RwLock<Vec<Arc<dyn UserAgentHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, handler: Arc<dyn B2bHandler>) {
        for method in handler.supported_methods() {
            self.handlers.insert(*method, handler.clone());
        }
    }

    /// `host` is matched case-insensitively against the request-URI host.
    pub fn register_domain_router(&self, host: impl Into<String>, handler: Arc<dyn B2bHandler>) {
        self.domain_routers.insert(host.into().to_ascii_lowercase(), handler);
    }

    pub async fn register_user_agent_handler(&self, handler: Arc<dyn UserAgentHandler>) {
        self.user_agent_handlers.write().await.push(handler);
    }

    pub async fn user_agent_handlers(&self) -> Vec<Arc<dyn UserAgentHandler>> {
        self.user_agent_handlers.read().await.clone()
    }

    /// Domain routers are consulted first; a mismatch falls through to
    /// the method registry, then to `MessageType::Default`.
    pub fn resolve(&self, request: &SipMessage) -> Option<Arc<dyn B2bHandler>> {
        if let Some(host) = request_host(request) {
            if let Some(handler) = self.domain_routers.get(&host) {
                return Some(handler.clone());
            }
        }
        let message_type = MessageType::from_method(request.method()?);
        self.handlers.get(&message_type).map(|h| h.clone()).or_else(|| self.handlers.get(&MessageType::Default).map(|h| h.clone()))
    }
}

fn request_host(request: &SipMessage) -> Option<String> {
    match &request.start_line {
        sigcore_sip::StartLine::Request { uri, .. } => Some(uri.host.to_string().to_ascii_lowercase()),
        sigcore_sip::StartLine::Response { .. } => None,
    }
}
