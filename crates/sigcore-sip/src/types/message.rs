//! The parsed SIP message: start line, ordered headers, body, and the
//! scratch state the core and upper layers hang off a message in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::SipUri;

/// Expands a compact header form (RFC 3261 §7.3.3) to its canonical lowercase
/// name. Unknown single letters pass through unchanged, case-insensitively
/// lowercased, matching the source table's lack of a fallback branch.
pub fn expand_header_name(name: &str) -> String {
    if name.len() == 1 {
        let expanded = match name.to_ascii_lowercase().as_str() {
            "a" => "accept-contact",
            "b" => "referred-by",
            "c" => "content-type",
            "e" => "content-encoding",
            "f" => "from",
            "i" => "call-id",
            "k" => "supported",
            "l" => "content-length",
            "m" => "contact",
            "o" => "event",
            "r" => "refer-to",
            "s" => "subject",
            "t" => "to",
            "u" => "allow-events",
            "v" => "via",
            other => other,
        };
        expanded.to_string()
    } else {
        name.to_ascii_lowercase()
    }
}

/// An ordered, case-insensitive multimap from header name to its sequence of
/// raw values. Lookup keys are the canonical expanded lowercase name; the
/// raw name as first seen on the wire (e.g. `v` rather than `Via`) is kept
/// separately and used when the message is re-serialized.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    order: Vec<String>,
    raw_names: HashMap<String, String>,
    values: HashMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value under `name`, expanding compact forms and recording
    /// the first-seen raw name for serialization.
    pub fn append(&mut self, raw_name: &str, value: impl Into<String>) {
        let canonical = expand_header_name(raw_name);
        if !self.values.contains_key(&canonical) {
            self.order.push(canonical.clone());
            self.raw_names.insert(canonical.clone(), raw_name.to_string());
        }
        self.values.entry(canonical).or_default().push(value.into());
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.values.get(&expand_header_name(name)).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&expand_header_name(name))
    }

    /// Replaces all values under `name` with a single value, preserving
    /// insertion order and the raw name if the header already existed.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let canonical = expand_header_name(name);
        if !self.values.contains_key(&canonical) {
            self.order.push(canonical.clone());
            self.raw_names.insert(canonical.clone(), name.to_string());
        }
        self.values.insert(canonical, vec![value.into()]);
    }

    /// Replaces only the first value under `name`, leaving any further
    /// values (e.g. a Via chain's later hops) untouched. A no-op if the
    /// header isn't present.
    pub fn set_first(&mut self, name: &str, value: impl Into<String>) {
        let canonical = expand_header_name(name);
        if let Some(values) = self.values.get_mut(&canonical) {
            if let Some(first) = values.first_mut() {
                *first = value.into();
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        let canonical = expand_header_name(name);
        if self.values.remove(&canonical).is_some() {
            self.order.retain(|n| n != &canonical);
            self.raw_names.remove(&canonical);
        }
    }

    /// Iterates headers in first-seen insertion order, one `(raw_name, value)`
    /// pair per value (a header with 3 values yields 3 pairs, each on its
    /// own wire line, per `commit()`'s one-name-per-line contract only when
    /// values were appended individually; callers that want RFC 3261 comma
    /// folding should join `get_all` themselves).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().flat_map(move |canonical| {
            let raw = self.raw_names.get(canonical).map(String::as_str).unwrap_or(canonical);
            self.values.get(canonical).into_iter().flatten().map(move |v| (raw, v.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The start line of a message: either a request line or a status line.
/// The variant itself is the classification; there is no ambiguous
/// "indeterminate" state once a `SipMessage` exists (see `Classified` in
/// the parser for the in-flight state before a start line is confirmed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: SipUri, version: String },
    Response { version: String, status: StatusCode, reason: String },
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: Headers,
    pub body: Bytes,
    /// Lines that failed the `name: value` split, retained verbatim so a
    /// relay can still forward a message the parser couldn't fully digest.
    pub bad_headers: Vec<String>,
    /// Per-message scratch state for the core/upper layers (`xor`,
    /// `transport-id`, `generate-local-response`, ...). Never serialized.
    pub properties: HashMap<String, String>,
    log_context: OnceLock<String>,
}

impl SipMessage {
    pub fn request(method: Method, uri: SipUri) -> Self {
        SipMessage {
            start_line: StartLine::Request { method, uri, version: "SIP/2.0".to_string() },
            headers: Headers::new(),
            body: Bytes::new(),
            bad_headers: Vec::new(),
            properties: HashMap::new(),
            log_context: OnceLock::new(),
        }
    }

    pub fn response(status: StatusCode, reason: impl Into<String>) -> Self {
        SipMessage {
            start_line: StartLine::Response {
                version: "SIP/2.0".to_string(),
                status,
                reason: reason.into(),
            },
            headers: Headers::new(),
            body: Bytes::new(),
            bad_headers: Vec::new(),
            properties: HashMap::new(),
            log_context: OnceLock::new(),
        }
    }

    /// Assembles a message from a parsed start line, header section, and
    /// any unparsable lines. Used by the parser once the header section is
    /// complete; the body is filled in afterward.
    pub(crate) fn assemble(start_line: StartLine, headers: Headers, bad_headers: Vec<String>) -> Self {
        SipMessage {
            start_line,
            headers,
            body: Bytes::new(),
            bad_headers,
            properties: HashMap::new(),
            log_context: OnceLock::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, StartLine::Response { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("call-id")
    }

    /// A short hex tag derived from the Call-ID, cached on first read and
    /// reused for the lifetime of the message. Used to correlate log lines
    /// for the same dialog/transaction without repeating the full Call-ID.
    pub fn log_context(&self) -> &str {
        self.log_context.get_or_init(|| match self.call_id() {
            Some(id) => format!("{:08x}", fnv1a(id.as_bytes())),
            None => "--------".to_string(),
        })
    }

    /// Re-emits the start line and headers in insertion order, one raw name
    /// per value line, followed by the blank line and body. Does not fix up
    /// Content-Length; callers that mutate the body must call
    /// [`Self::sync_content_length`] first.
    pub fn commit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        match &self.start_line {
            StartLine::Request { method, uri, version } => {
                out.extend_from_slice(format!("{} {} {}\r\n", method, uri, version).as_bytes());
            }
            StartLine::Response { version, status, reason } => {
                out.extend_from_slice(format!("{} {} {}\r\n", version, status.0, reason).as_bytes());
            }
        }
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Sets `Content-Length` to `body.len()`, as `commit()` requires.
    pub fn sync_content_length(&mut self) {
        let len = self.body.len();
        self.headers.set("content-length", len.to_string());
    }

    /// RFC 3261 dialog identifier: Call-ID plus the local and remote tags
    /// (From-tag/To-tag on a request, swapped on a response, since a
    /// response's To is the remote party's tag). Tags may be absent before
    /// the dialog is established, in which case the identifier degrades to
    /// whatever tags are present. The B2BUA layer uses this only as
    /// `B2bPairing::dialog_hint` for logging/correlation; the core does not
    /// persist dialogs.
    pub fn dialog_id(&self) -> Option<String> {
        let call_id = self.call_id()?;
        let (local_tag, remote_tag) = match &self.start_line {
            StartLine::Request { .. } => (tag_from(self.headers.get("from")), tag_from(self.headers.get("to"))),
            StartLine::Response { .. } => (tag_from(self.headers.get("to")), tag_from(self.headers.get("from"))),
        };
        Some(match (local_tag, remote_tag) {
            (Some(a), Some(b)) => format!("{call_id}:{a}:{b}"),
            (Some(a), None) | (None, Some(a)) => format!("{call_id}:{a}"),
            (None, None) => call_id.to_string(),
        })
    }

    /// True for a request carrying a To-tag: it belongs to an existing
    /// dialog rather than establishing a new one.
    pub fn is_mid_dialog(&self) -> bool {
        self.is_request() && tag_from(self.headers.get("to")).is_some()
    }
}

/// Extracts the `tag` parameter from a From/To header value, e.g.
/// `"Bob <sip:bob@biloxi.com>;tag=a6c85cf"` -> `Some("a6c85cf")`.
fn tag_from(header: Option<&str>) -> Option<String> {
    let header = header?;
    header.split(';').skip(1).find_map(|param| {
        let mut parts = param.splitn(2, '=');
        let name = parts.next()?.trim();
        if name.eq_ignore_ascii_case("tag") {
            parts.next().map(|v| v.trim().to_string())
        } else {
            None
        }
    })
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.commit()))
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::status::OK;
    use crate::types::uri::SipUri;

    #[test]
    fn expands_compact_header_names() {
        assert_eq!(expand_header_name("v"), "via");
        assert_eq!(expand_header_name("Via"), "via");
        assert_eq!(expand_header_name("z"), "z");
    }

    #[test]
    fn preserves_first_seen_raw_name() {
        let mut h = Headers::new();
        h.append("v", "SIP/2.0/UDP a:5060;branch=z9hG4bKx");
        let (raw, _) = h.iter().next().unwrap();
        assert_eq!(raw, "v");
        assert!(h.contains("via"));
    }

    #[test]
    fn set_first_touches_only_the_top_value() {
        let mut h = Headers::new();
        h.append("Via", "SIP/2.0/UDP a:5060;branch=z9hG4bK1");
        h.append("Via", "SIP/2.0/UDP b:5060;branch=z9hG4bK0");
        h.set_first("via", "SIP/2.0/UDP a:5060;branch=z9hG4bK1;received=9.9.9.9");
        let all = h.get_all("via");
        assert_eq!(all[0], "SIP/2.0/UDP a:5060;branch=z9hG4bK1;received=9.9.9.9");
        assert_eq!(all[1], "SIP/2.0/UDP b:5060;branch=z9hG4bK0");
    }

    #[test]
    fn log_context_is_stable() {
        let mut msg = SipMessage::response(OK, "OK");
        msg.headers.set("call-id", "abc123@example.com");
        let first = msg.log_context().to_string();
        let second = msg.log_context().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn dialog_id_combines_call_id_and_tags() {
        let uri = SipUri::sip("example.com").with_user("bob");
        let mut msg = SipMessage::request(Method::Invite, uri);
        msg.headers.append("Call-ID", "c1@example.com");
        msg.headers.append("From", "Alice <sip:alice@example.com>;tag=abc");
        assert_eq!(msg.dialog_id().as_deref(), Some("c1@example.com:abc"));
        assert!(!msg.is_mid_dialog());

        msg.headers.append("To", "Bob <sip:bob@example.com>;tag=xyz");
        assert_eq!(msg.dialog_id().as_deref(), Some("c1@example.com:abc:xyz"));
        assert!(msg.is_mid_dialog());
    }

    #[test]
    fn commit_round_trips_request_line() {
        let uri = SipUri::sip("example.com").with_user("bob");
        let mut msg = SipMessage::request(Method::Invite, uri);
        msg.headers.append("Call-ID", "c1");
        msg.sync_content_length();
        let text = String::from_utf8(msg.commit()).unwrap();
        assert!(text.starts_with("INVITE sip:bob@example.com SIP/2.0\r\n"));
        assert!(text.contains("Call-ID: c1\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }
}
