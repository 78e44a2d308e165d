//! Transaction key derivation (RFC 3261 §17.1.3 / §17.2.3).

use std::fmt;

use sigcore_sip::{Method, SipMessage};

use crate::error::{Error, Result};

const MAGIC_COOKIE: &str = "z9hG4bK";

/// Folds ACK onto the INVITE transaction it acknowledges; every other
/// method keys its own transaction.
fn method_for_key(method: &Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other.clone(),
    }
}

/// Identifies one transaction. Client and server transactions for the
/// same branch are distinct entries (`is_server` distinguishes them),
/// since RFC 3261 keeps separate client and server transaction tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    branch: String,
    method: Method,
    is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        TransactionKey { branch: branch.into(), method: method_for_key(&method), is_server }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Derives the key for an inbound or outbound request. Prefers the
    /// top Via's `branch` parameter when it carries the RFC 3261 magic
    /// cookie; falls back to `CSeq number + Call-ID` for legacy peers
    /// that predate it, per §3's `method_for_key + cseq_number + branch`
    /// key shape — the magic-cookie branch alone is already unique, but
    /// the legacy fallback needs the CSeq number too or two non-cookie
    /// requests sharing a Call-ID (e.g. a re-INVITE) would collide.
    pub fn for_request(message: &SipMessage, is_server: bool) -> Result<Self> {
        let method = message.method().ok_or(Error::MissingVia)?.clone();
        let via = message.headers.get("via").ok_or(Error::MissingVia)?;
        let branch = extract_branch(via);
        match branch {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) => Ok(TransactionKey::new(branch, method, is_server)),
            _ => {
                let call_id = message.call_id().ok_or(Error::MissingVia)?;
                let cseq_number = cseq_number(message).ok_or(Error::MissingCSeq)?;
                Ok(TransactionKey::new(format!("legacy:{call_id}:{cseq_number}"), method, is_server))
            }
        }
    }

    /// Derives the key a response correlates to: same branch, method
    /// taken from CSeq (folded the same way as for requests).
    pub fn for_response(message: &SipMessage, is_server: bool) -> Result<Self> {
        let cseq = message.headers.get("cseq").ok_or(Error::MissingCSeq)?;
        let mut cseq_parts = cseq.split_whitespace();
        let cseq_number = cseq_parts.next().ok_or(Error::MissingCSeq)?;
        let method_token = cseq_parts.next().ok_or(Error::MissingCSeq)?;
        let method: Method = method_token.parse().map_err(|_| Error::MissingCSeq)?;
        let via = message.headers.get("via").ok_or(Error::MissingVia)?;
        let branch = extract_branch(via);
        match branch {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) => Ok(TransactionKey::new(branch, method, is_server)),
            _ => {
                let call_id = message.call_id().ok_or(Error::MissingVia)?;
                Ok(TransactionKey::new(format!("legacy:{call_id}:{cseq_number}"), method, is_server))
            }
        }
    }
}

/// The CSeq sequence number token (not the method), e.g. `"1"` out of
/// `"1 INVITE"`.
fn cseq_number(message: &SipMessage) -> Option<&str> {
    message.headers.get("cseq")?.split_whitespace().next()
}

fn extract_branch(via: &str) -> Option<String> {
    via.split(';').skip(1).find_map(|param| {
        let mut parts = param.splitn(2, '=');
        let name = parts.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            parts.next().map(|v| v.trim().to_string())
        } else {
            None
        }
    })
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", if self.is_server { "srv" } else { "cli" }, self.method, self.branch)
    }
}

/// Generates a fresh branch parameter value bearing the RFC 3261 magic
/// cookie, suitable for a new client transaction's Via header.
pub fn generate_branch() -> String {
    format!("{MAGIC_COOKIE}{:016x}", fastrand::u64(..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigcore_sip::SipUri;

    fn invite_with_branch(branch: &str) -> SipMessage {
        let mut msg = SipMessage::request(Method::Invite, SipUri::sip("example.com"));
        msg.headers.append("Via", format!("SIP/2.0/UDP host;branch={branch}"));
        msg.headers.append("Call-ID", "c1");
        msg.headers.append("CSeq", "1 INVITE");
        msg
    }

    #[test]
    fn ack_folds_onto_invite_key() {
        let invite_key = TransactionKey::new("z9hG4bKx", Method::Invite, false);
        let ack_key = TransactionKey::new("z9hG4bKx", Method::Ack, false);
        assert_eq!(invite_key, ack_key);
    }

    #[test]
    fn retransmit_has_same_key_as_original() {
        let a = TransactionKey::for_request(&invite_with_branch("z9hG4bK-xyz"), true).unwrap();
        let b = TransactionKey::for_request(&invite_with_branch("z9hG4bK-xyz"), true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_magic_cookie_falls_back_to_call_id_and_cseq() {
        let key = TransactionKey::for_request(&invite_with_branch("not-a-real-branch"), true).unwrap();
        assert_eq!(key.branch(), "legacy:c1:1");
    }

    #[test]
    fn legacy_fallback_distinguishes_requests_sharing_a_call_id_by_cseq() {
        let mut first = invite_with_branch("not-a-real-branch");
        first.headers.set("cseq", "1 INVITE");
        let mut second = invite_with_branch("not-a-real-branch");
        second.headers.set("cseq", "2 INVITE");

        let a = TransactionKey::for_request(&first, true).unwrap();
        let b = TransactionKey::for_request(&second, true).unwrap();
        assert_ne!(a, b, "a re-INVITE sharing a Call-ID must not collide with the original transaction");
    }
}
