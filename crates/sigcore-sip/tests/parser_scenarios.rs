use sigcore_sip::parser::{self, Consumed, StreamParser};
use sigcore_sip::types::method::Method;

/// S5 — compact header round trip: a `v:` Via line parses to the Via
/// header, and re-serializing uses the raw first-seen name, not `Via`.
#[test]
fn compact_via_round_trips_with_raw_name() {
    let data = b"OPTIONS sip:bob@example.com SIP/2.0\r\n\
v: SIP/2.0/UDP a:5060;branch=z9hG4bKx\r\n\
Call-ID: abc\r\n\
Content-Length: 0\r\n\r\n";

    let message = parser::parse(data).expect("valid message");
    assert_eq!(message.headers.get("via"), Some("SIP/2.0/UDP a:5060;branch=z9hG4bKx"));

    let rendered = String::from_utf8(message.commit()).unwrap();
    assert!(rendered.contains("v: SIP/2.0/UDP a:5060;branch=z9hG4bKx\r\n"));
    assert!(!rendered.contains("Via:"));
}

/// S6 — stream resumption: feeding an INVITE one byte at a time yields
/// `NeedMore` until the final body byte, then `Done`; a second message
/// packed into the same buffer is recovered from the residual tail.
#[test]
fn stream_parser_resumes_across_byte_boundaries_and_pipelined_messages() {
    let invite = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host.example.com;branch=z9hG4bK1\r\n\
Call-ID: call-1\r\n\
Content-Length: 2\r\n\r\nhi";

    let mut parser = StreamParser::new();
    for &byte in &invite[..invite.len() - 1] {
        match parser.feed(&[byte]).unwrap() {
            Consumed::NeedMore => {}
            Consumed::Done { .. } => panic!("completed before the body ended"),
        }
    }

    let mut pipelined = invite.to_vec();
    pipelined.extend_from_slice(invite);

    let mut offset = 0;
    let mut parser = StreamParser::new();
    let mut messages = Vec::new();
    loop {
        match parser.feed(&pipelined[offset..]).unwrap() {
            Consumed::NeedMore => break,
            Consumed::Done { message, consumed } => {
                offset += consumed;
                messages.push(message);
            }
        }
    }

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].method(), Some(&Method::Invite));
    assert_eq!(&messages[0].body[..], b"hi");
    assert_eq!(offset, pipelined.len());
}
