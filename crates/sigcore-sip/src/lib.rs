//! # sigcore-sip
//!
//! SIP (RFC 3261) message representation and parsing for the signalling
//! core: a `SipMessage` type carrying an ordered, case-insensitive header
//! multimap, and a parser that accepts both a complete in-memory buffer and
//! a byte-at-a-time stream for TCP/TLS/WebSocket transports.
//!
//! ```rust
//! use sigcore_sip::parser;
//!
//! let data = b"INVITE sip:bob@example.com SIP/2.0\r\n\
//! Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
//! Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
//! CSeq: 314159 INVITE\r\n\
//! Content-Length: 0\r\n\r\n";
//!
//! let message = parser::parse(data).expect("valid SIP message");
//! assert!(message.is_request());
//! ```

pub mod error;
pub mod parser;
pub mod types;

pub use error::{Error, Result};
pub use types::{Headers, Method, SipMessage, SipUri, StartLine, StatusCode};
