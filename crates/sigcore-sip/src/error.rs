use std::io;
use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or manipulating SIP messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The start line is neither a valid request line nor a valid status line.
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),

    /// A header line could not be split into `name: value`.
    #[error("invalid header line: {0}")]
    InvalidHeader(String),

    /// Content-Length did not match the number of body bytes available.
    #[error("Content-Length mismatch: expected {expected}, got {actual}")]
    ContentLengthMismatch { expected: usize, actual: usize },

    /// A stream transport reached EOF with a header section still open and no
    /// Content-Length to bound the body.
    #[error("unterminated message: {0}")]
    Unterminated(String),

    /// A byte outside CR/LF/HTAB was encountered where only printable ASCII is legal.
    #[error("invalid character 0x{byte:02x} in state {state}")]
    InvalidCharacter { byte: u8, state: &'static str },

    /// A SIP URI failed to parse.
    #[error("invalid SIP URI: {0}")]
    InvalidUri(String),

    /// A malformed component inside an otherwise-parseable URI.
    #[error("malformed URI component {component}: {message}")]
    MalformedUriComponent { component: String, message: String },

    /// Generic I/O failure surfaced from a stream reader.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
