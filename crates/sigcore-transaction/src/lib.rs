//! RFC 3261 §17 transaction layer: the four client/server INVITE and
//! non-INVITE state machines, keyed and timed the way the RFC specifies,
//! sitting directly on top of `sigcore-transport`.
//!
//! Transactions do not themselves understand dialogs or forking; they
//! match requests to responses by branch and method, retransmit on
//! unreliable transports, and hand matched events up to a
//! [`manager::TransactionUser`].

pub mod error;
pub mod key;
pub mod manager;
pub mod state;
pub mod timer;
pub mod transaction;

pub use error::{Error, Result};
pub use key::TransactionKey;
pub use manager::{TransactionManager, TransactionUser};
pub use state::TransactionState;
pub use timer::{TimerKind, TimerSettings};
pub use transaction::{Kind, Transaction};

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use sigcore_sip::{Method, SipMessage, SipUri};
    use sigcore_transport::Protocol;
    use tokio::sync::mpsc;

    use super::*;

    struct RecordingUser {
        responses: mpsc::UnboundedSender<(TransactionKey, Box<SipMessage>)>,
    }

    #[async_trait]
    impl TransactionUser for RecordingUser {
        async fn on_new_server_transaction(&self, _key: TransactionKey, _request: Box<SipMessage>, _source: SocketAddr) {}

        async fn on_response(&self, key: TransactionKey, response: Box<SipMessage>) {
            let _ = self.responses.send((key, response));
        }

        async fn on_ack_or_2xx(&self, _request: Box<SipMessage>, _source: SocketAddr) {}
    }

    fn sample_invite() -> SipMessage {
        let mut msg = SipMessage::request(Method::Invite, SipUri::sip("example.com"));
        msg.headers.append("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-test-1");
        msg.headers.append("Call-ID", "call-1@test");
        msg.headers.append("CSeq", "1 INVITE");
        msg
    }

    /// Timer B (64*T1) fires when nothing answers a client INVITE, and the
    /// manager synthesizes a 408 rather than leaving the caller hanging.
    #[tokio::test(start_paused = true)]
    async fn client_invite_times_out_without_a_transport() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let user = Arc::new(RecordingUser { responses: tx });
        let timers = TimerSettings { t1: Duration::from_millis(10), t2: Duration::from_millis(80), t4: Duration::from_millis(100) };
        let manager = TransactionManager::spawn(timers, user);

        let destination: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        // No transport registered for UDP: the initial send fails immediately.
        let result = manager.create_client_transaction(sample_invite(), destination, Protocol::Udp).await;
        assert!(result.is_err());

        let _ = rx.try_recv();
    }
}
