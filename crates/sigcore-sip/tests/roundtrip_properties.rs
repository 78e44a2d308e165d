//! Testable-property invariants from §8: `parse(serialize(M)) ≡ M` for a
//! message with no `bad_headers`, and `SipUri` equality ignoring
//! parameter/header order (§3).

use proptest::prelude::*;
use sigcore_sip::parser;
use sigcore_sip::types::uri::SipUri;
use sigcore_sip::{Method, SipMessage};

fn token() -> impl Strategy<Value = String> {
    "[a-z]{2,8}"
}

fn host() -> impl Strategy<Value = String> {
    "[a-z]{2,8}\\.[a-z]{2,6}"
}

fn header_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9-]{1,9}"
        .prop_filter("must not collide with the reserved headers this test sets explicitly", |s| {
            !matches!(s.to_ascii_lowercase().as_str(), "call-id" | "cseq" | "content-length" | "via")
        })
}

fn header_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._:;=@/-]{1,24}"
}

fn method() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::Invite),
        Just(Method::Ack),
        Just(Method::Bye),
        Just(Method::Cancel),
        Just(Method::Register),
        Just(Method::Options),
        Just(Method::Subscribe),
        Just(Method::Notify),
    ]
}

proptest! {
    /// Invariant 1: a message built in memory, committed to the wire, and
    /// re-parsed produces a byte-identical second commit — headers keep
    /// their first-seen raw names and insertion order, and the body
    /// survives untouched.
    #[test]
    fn request_round_trips_through_commit_and_parse(
        m in method(),
        uri_host in host(),
        extra_headers in prop::collection::vec((header_name(), header_value()), 0..6),
        body in prop::collection::vec(any::<u8>(), 0..48),
    ) {
        let mut message = SipMessage::request(m, SipUri::sip(uri_host));
        message.headers.append("Via", "SIP/2.0/UDP host.example.com;branch=z9hG4bK-prop");
        message.headers.append("Call-ID", "roundtrip-call-id@example.com");
        message.headers.append("CSeq", "1 INVITE");
        for (name, value) in &extra_headers {
            message.headers.append(name, value.clone());
        }
        message.body = body.into();
        message.sync_content_length();

        let first = message.commit();
        let parsed = parser::parse(&first).expect("a message this crate built must re-parse");
        prop_assert!(parsed.bad_headers.is_empty());

        let second = parsed.commit();
        prop_assert_eq!(first, second);
    }

    /// §3: `SipUri` equality ignores parameter order but is exact on names
    /// and values (case-insensitive on names).
    #[test]
    fn uri_display_then_parse_round_trips(
        h in host(),
        user in proptest::option::of(token()),
        port in proptest::option::of(1u16..=65535u16),
        params in prop::collection::vec((token(), proptest::option::of(token())), 0..4),
    ) {
        let mut uri = SipUri::sip(h);
        if let Some(user) = user {
            uri = uri.with_user(user);
        }
        if let Some(port) = port {
            uri = uri.with_port(port);
        }
        for (name, value) in params {
            uri.set_param(name, value);
        }

        let text = uri.to_string();
        let reparsed: SipUri = text.parse().expect("a URI this crate rendered must re-parse");
        prop_assert_eq!(uri, reparsed);
    }

    #[test]
    fn uri_equality_ignores_parameter_order(h in host(), a in token(), b in token()) {
        prop_assume!(a != b);

        let mut forward = SipUri::sip(h.clone());
        forward.set_param(a.clone(), None);
        forward.set_param(b.clone(), None);

        let mut reversed = SipUri::sip(h);
        reversed.set_param(b, None);
        reversed.set_param(a, None);

        prop_assert_eq!(forward, reversed);
    }
}
