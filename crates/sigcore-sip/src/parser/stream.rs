//! Byte-at-a-time parser state machine, faithful to the original's
//! `consumeOne`/`consume` pair, plus the full-buffer parse used once a
//! message's header section is complete.

use std::str::FromStr;

use bytes::Bytes;

use crate::error::Error;
use crate::types::message::{Headers, SipMessage, StartLine};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::SipUri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    StartLine,
    ExpectLf1,
    HeaderLineStart,
    HeaderLws,
    HeaderName,
    HeaderValue,
    ExpectLf2,
    ExpectLf3,
    ExpectBody,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::StartLine => "start-line",
            State::ExpectLf1 => "expect-lf-1",
            State::HeaderLineStart => "header-line-start",
            State::HeaderLws => "header-lws",
            State::HeaderName => "header-name",
            State::HeaderValue => "header-value",
            State::ExpectLf2 => "expect-lf-2",
            State::ExpectLf3 => "expect-lf-3",
            State::ExpectBody => "expect-body",
        }
    }
}

/// The outcome of feeding one more chunk into a [`StreamParser`].
#[derive(Debug)]
pub enum Consumed {
    /// More bytes are needed before a full message is available.
    NeedMore,
    /// A complete message was parsed; `rest` is the number of bytes from the
    /// input slice that belonged to this message (a caller with a second
    /// message packed into the same read should re-feed the remainder).
    Done { message: Box<SipMessage>, consumed: usize },
}

/// A single in-progress message's worth of parser state. One instance per
/// connection for stream transports; a fresh instance per datagram for UDP.
pub struct StreamParser {
    state: State,
    /// Raw bytes of the start line and header section, CRLFs included, fed
    /// to [`parse_head`] once the blank line terminator is seen.
    head: Vec<u8>,
    /// Bytes seen while idle: CRLF-only NAT keepalives and other junk that
    /// precedes a real start line. Never parsed, just discarded per message.
    idle_buffer: Vec<u8>,
    body: Vec<u8>,
    expected_body_len: usize,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        StreamParser {
            state: State::Idle,
            head: Vec::new(),
            idle_buffer: Vec::new(),
            body: Vec::new(),
            expected_body_len: 0,
        }
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.head.clear();
        self.idle_buffer.clear();
        self.body.clear();
        self.expected_body_len = 0;
    }

    /// Feeds as much of `input` as needed to complete one message. Returns
    /// [`Consumed::Done`] with the number of bytes actually consumed, or
    /// [`Consumed::NeedMore`] after the whole slice has been consumed with
    /// no message yet complete.
    pub fn feed(&mut self, input: &[u8]) -> Result<Consumed, Error> {
        for (i, &byte) in input.iter().enumerate() {
            if self.consume_one(byte)? {
                let message = self.finish()?;
                self.reset();
                return Ok(Consumed::Done { message: Box::new(message), consumed: i + 1 });
            }
        }
        Ok(Consumed::NeedMore)
    }

    /// Returns `true` once the byte just fed completes the message (header
    /// section done with no body, or the last expected body byte).
    fn consume_one(&mut self, input: u8) -> Result<bool, Error> {
        if self.state == State::Idle {
            if !is_char(input) || input == b'\r' || input == b'\n' {
                self.idle_buffer.push(input);
                return Ok(false);
            }
            self.head.clear();
            self.state = State::StartLine;
        }

        match self.state {
            State::StartLine => {
                if input == b'\r' {
                    self.state = State::ExpectLf1;
                } else if !is_char(input) || is_ctl(input) {
                    return Err(Error::InvalidCharacter { byte: input, state: self.state.name() });
                }
                self.head.push(input);
                Ok(false)
            }
            State::ExpectLf1 => {
                if input == b'\n' {
                    self.state = State::HeaderLineStart;
                    self.head.push(input);
                    Ok(false)
                } else {
                    Err(Error::InvalidCharacter { byte: input, state: self.state.name() })
                }
            }
            State::HeaderLineStart => {
                if input == b'\r' {
                    self.state = State::ExpectLf3;
                } else if input == b' ' || input == b'\t' {
                    self.state = State::HeaderLws;
                } else if !is_char(input) || is_ctl(input) {
                    return Err(Error::InvalidCharacter { byte: input, state: self.state.name() });
                } else {
                    self.state = State::HeaderName;
                }
                self.head.push(input);
                Ok(false)
            }
            State::HeaderLws => {
                if input == b'\r' {
                    self.state = State::ExpectLf2;
                } else if input == b' ' || input == b'\t' {
                    // stays in HeaderLws
                } else if is_ctl(input) {
                    return Err(Error::InvalidCharacter { byte: input, state: self.state.name() });
                } else {
                    self.state = State::HeaderValue;
                }
                self.head.push(input);
                Ok(false)
            }
            State::HeaderName => {
                if input == b':' {
                    self.state = State::HeaderValue;
                } else if !is_char(input) || is_ctl(input) {
                    return Err(Error::InvalidCharacter { byte: input, state: self.state.name() });
                }
                self.head.push(input);
                Ok(false)
            }
            State::HeaderValue => {
                if input == b'\r' {
                    self.state = State::ExpectLf2;
                } else if !is_char(input) || is_ctl(input) {
                    return Err(Error::InvalidCharacter { byte: input, state: self.state.name() });
                }
                self.head.push(input);
                Ok(false)
            }
            State::ExpectLf2 => {
                if input == b'\n' {
                    self.state = State::HeaderLineStart;
                    self.head.push(input);
                    Ok(false)
                } else {
                    Err(Error::InvalidCharacter { byte: input, state: self.state.name() })
                }
            }
            State::ExpectLf3 => {
                self.head.push(input);
                if input != b'\n' {
                    return Err(Error::InvalidCharacter { byte: input, state: self.state.name() });
                }
                let content_length = peek_content_length(&self.head)?;
                match content_length {
                    Some(len) if len > 0 => {
                        self.expected_body_len = len;
                        self.state = State::ExpectBody;
                        Ok(false)
                    }
                    _ => Ok(true),
                }
            }
            State::ExpectBody => {
                self.body.push(input);
                Ok(self.body.len() >= self.expected_body_len)
            }
            State::Idle => unreachable!("handled above"),
        }
    }

    fn finish(&mut self) -> Result<SipMessage, Error> {
        let mut message = parse_head(&self.head)?;
        message.body = Bytes::from(std::mem::take(&mut self.body));
        if let Some(expected) = message.headers.get("content-length").and_then(|v| v.trim().parse::<usize>().ok())
        {
            if expected != message.body.len() {
                return Err(Error::ContentLengthMismatch { expected, actual: message.body.len() });
            }
        }
        Ok(message)
    }
}

fn peek_content_length(head: &[u8]) -> Result<Option<usize>, Error> {
    let text = std::str::from_utf8(head).map_err(|_| Error::Unterminated("non-utf8 header section".into()))?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if crate::types::message::expand_header_name(name.trim()) == "content-length" {
                return Ok(value.trim().parse::<usize>().ok());
            }
        }
    }
    Ok(None)
}

fn is_char(b: u8) -> bool {
    b < 128
}

fn is_ctl(b: u8) -> bool {
    b < 32 || b == 127
}

/// Parses a full in-memory buffer: start line, header section, and (if
/// `Content-Length` indicates one) a body taken from whatever follows the
/// blank line terminator.
pub fn parse(input: &[u8]) -> Result<SipMessage, Error> {
    let terminator = find_header_terminator(input)
        .ok_or_else(|| Error::Unterminated("no CRLFCRLF header terminator found".into()))?;
    let (head, rest) = input.split_at(terminator);
    let mut message = parse_head(head)?;
    let body = &rest[4..];
    if let Some(expected) = message.headers.get("content-length").and_then(|v| v.trim().parse::<usize>().ok()) {
        if expected > body.len() {
            return Err(Error::ContentLengthMismatch { expected, actual: body.len() });
        }
        message.body = Bytes::copy_from_slice(&body[..expected]);
    } else if !body.is_empty() {
        message.body = Bytes::copy_from_slice(body);
    }
    Ok(message)
}

fn find_header_terminator(input: &[u8]) -> Option<usize> {
    input.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Result<SipMessage, Error> {
    let text = std::str::from_utf8(head).map_err(|_| Error::InvalidHeader("non-utf8 header section".into()))?;
    let mut lines = unfold_lines(text);
    if lines.is_empty() {
        return Err(Error::Unterminated("empty message".into()));
    }
    let start_line = lines.remove(0);
    let start_line = parse_start_line(&start_line)?;

    let mut headers = Headers::new();
    let mut bad_headers = Vec::new();
    for line in lines {
        match line.split_once(':') {
            Some((name, value)) => headers.append(name.trim(), value.trim()),
            None if line.trim().is_empty() => {}
            None => bad_headers.push(line),
        }
    }

    Ok(SipMessage::assemble(start_line, headers, bad_headers))
}

/// Splits the header section into logical lines, joining any line that
/// starts with whitespace onto the previous one (RFC 3261 §7.3.1 folding).
fn unfold_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split("\r\n") {
        if raw.is_empty() {
            continue;
        }
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            let last = lines.last_mut().unwrap();
            last.push(' ');
            last.push_str(raw.trim_start());
        } else {
            lines.push(raw.to_string());
        }
    }
    lines
}

fn parse_start_line(line: &str) -> Result<StartLine, Error> {
    let mut parts = line.splitn(3, ' ');
    let first = parts.next().ok_or_else(|| Error::InvalidStartLine(line.to_string()))?;
    let second = parts.next().ok_or_else(|| Error::InvalidStartLine(line.to_string()))?;
    let third = parts.next().ok_or_else(|| Error::InvalidStartLine(line.to_string()))?;

    if first.starts_with("SIP/") {
        let status: u16 = second.parse().map_err(|_| Error::InvalidStartLine(line.to_string()))?;
        Ok(StartLine::Response { version: first.to_string(), status: StatusCode(status), reason: third.to_string() })
    } else {
        let method = Method::from_str(first)?;
        let uri = SipUri::from_str(second)?;
        if !third.starts_with("SIP/") {
            return Err(Error::InvalidStartLine(line.to_string()));
        }
        Ok(StartLine::Request { method, uri, version: third.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host.example.com;branch=z9hG4bK776asdhds\r\n\
Call-ID: a84b4c76e66710@host.example.com\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 4\r\n\
\r\n\
abcd";

    #[test]
    fn parses_full_buffer() {
        let msg = parse(INVITE).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(&Method::Invite));
        assert_eq!(&msg.body[..], b"abcd");
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@host.example.com"));
    }

    #[test]
    fn feeds_byte_by_byte_and_resumes_on_remainder() {
        let mut parser = StreamParser::new();
        let mut combined = INVITE.to_vec();
        combined.extend_from_slice(INVITE);
        let mut offset = 0;
        let mut completed = 0;
        loop {
            match parser.feed(&combined[offset..]).unwrap() {
                Consumed::NeedMore => break,
                Consumed::Done { consumed, .. } => {
                    offset += consumed;
                    completed += 1;
                    if completed == 2 {
                        break;
                    }
                }
            }
        }
        assert_eq!(completed, 2);
        assert_eq!(offset, combined.len());
    }

    #[test]
    fn tolerates_leading_keepalive_junk() {
        let mut input = b"\r\n\r\n".to_vec();
        input.extend_from_slice(INVITE);
        let msg = parse_leading_junk_then_parse(&input);
        assert!(msg.is_request());
    }

    fn parse_leading_junk_then_parse(input: &[u8]) -> SipMessage {
        let mut parser = StreamParser::new();
        match parser.feed(input).unwrap() {
            Consumed::Done { message, .. } => *message,
            Consumed::NeedMore => panic!("expected message"),
        }
    }

    #[test]
    fn rejects_control_character_in_header_name() {
        let bad = b"OPTIONS sip:a@b SIP/2.0\r\nVi\x01a: x\r\n\r\n";
        let mut parser = StreamParser::new();
        let err = parser.feed(bad).unwrap_err();
        assert!(matches!(err, Error::InvalidCharacter { .. }));
    }
}
