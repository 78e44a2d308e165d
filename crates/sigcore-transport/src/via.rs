//! Response routing off the top Via header (§4.3, RFC 3261 §18.2.2 /
//! RFC 3581). A server transaction's responses don't necessarily go back
//! to the socket a request arrived on: the top Via's `sent-by` and its
//! `received`/`rport` parameters (stamped by the transport on receipt)
//! decide the real next hop.

use std::net::{IpAddr, SocketAddr};

/// The parsed form of a request's top Via header, enough to resolve
/// where its response belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaSentBy {
    pub host: String,
    pub port: Option<u16>,
    pub received: Option<IpAddr>,
    /// `Some(None)` is the bare `rport` flag requesting the server stamp
    /// the port back; `Some(Some(port))` is one already stamped.
    pub rport: Option<Option<u16>>,
}

/// Parses the `sent-by` and parameters off a raw top Via value, e.g.
/// `"SIP/2.0/UDP 192.0.2.4:5060;branch=z9hG4bKx;rport;received=203.0.113.9"`.
pub fn parse_sent_by(via: &str) -> Option<ViaSentBy> {
    let mut segments = via.splitn(2, ';');
    let transport_and_addr = segments.next()?;
    let addr = transport_and_addr.rsplit(' ').next()?.trim();
    let (host, port) = split_host_port(addr);

    let mut received = None;
    let mut rport = None;
    if let Some(params) = segments.next() {
        for param in params.split(';') {
            let mut parts = param.splitn(2, '=');
            let name = parts.next()?.trim();
            let value = parts.next().map(str::trim);
            if name.eq_ignore_ascii_case("received") {
                received = value.and_then(|v| v.parse().ok());
            } else if name.eq_ignore_ascii_case("rport") {
                rport = Some(value.and_then(|v| v.parse().ok()));
            }
        }
    }

    Some(ViaSentBy { host, port, received, rport })
}

fn split_host_port(addr: &str) -> (String, Option<u16>) {
    if let Some(stripped) = addr.strip_prefix('[') {
        // IPv6 literal: "[::1]:5060" or "[::1]".
        if let Some(end) = stripped.find(']') {
            let host = format!("[{}]", &stripped[..end]);
            let rest = &stripped[end + 1..];
            let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (addr.to_string(), None);
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()),
        None => (addr.to_string(), None),
    }
}

/// A host is "public" for this purpose if `sent-by` names an address the
/// transport can actually reach without NAT-traversal help: anything
/// that isn't a private/loopback/link-local literal. Domain names are
/// treated as public since resolving them is the `Resolver`'s job, not
/// this layer's.
fn is_public_host(host: &str) -> bool {
    let stripped = host.trim_start_matches('[').trim_end_matches(']');
    match stripped.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => !(v4.is_private() || v4.is_loopback() || v4.is_link_local()),
        Ok(IpAddr::V6(v6)) => !(v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80),
        Err(_) => true,
    }
}

/// Resolves the socket address a response to `via` should be sent to,
/// given the address the request actually arrived from.
///
/// Per RFC 3581 (§9 Open Questions: "rport wins when present"): an
/// explicit `rport` value takes priority over everything else, since its
/// presence means the client asked for the reflected port explicitly.
/// Next, `received` (stamped when `sent-by`'s host didn't match the
/// packet's source address) picks the host. Only once both are absent,
/// and `sent-by` names a public host, is `sent-by` trusted outright. If
/// `use_source_address_for_responses` is set it overrides all of the
/// above unconditionally, e.g. for peers behind a NAT this deployment
/// already knows to never trust for addressing.
pub fn resolve_response_target(
    via: &ViaSentBy,
    request_source: SocketAddr,
    use_source_address_for_responses: bool,
) -> SocketAddr {
    if use_source_address_for_responses {
        return request_source;
    }

    let received_ip = via.received.unwrap_or(request_source.ip());

    if let Some(rport) = via.rport {
        let port = rport.unwrap_or_else(|| request_source.port());
        return SocketAddr::new(received_ip, port);
    }

    if via.received.is_some() {
        return SocketAddr::new(received_ip, via.port.unwrap_or(request_source.port()));
    }

    if is_public_host(&via.host) {
        if let (Ok(ip), Some(port)) = (via.host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>(), via.port) {
            return SocketAddr::new(ip, port);
        }
    }

    request_source
}

/// Stamps `received` (always, if the packet's source differs from
/// `sent-by`'s host) and fills a bare `rport` flag with the actual
/// source port, mutating the raw Via value in place. Called once per
/// inbound request, before a server transaction captures its `peer`.
pub fn stamp_received_and_rport(via: &str, source: SocketAddr) -> String {
    let Some(parsed) = parse_sent_by(via) else { return via.to_string() };

    let needs_received = parsed.host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() != Ok(source.ip());
    let mut out = via.to_string();

    if parsed.rport == Some(None) {
        out = replace_bare_rport(&out, source.port());
    }
    if needs_received && parsed.received.is_none() {
        out.push_str(&format!(";received={}", source.ip()));
    }
    out
}

fn replace_bare_rport(via: &str, port: u16) -> String {
    via.split(';')
        .map(|segment| if segment.trim().eq_ignore_ascii_case("rport") { format!("rport={port}") } else { segment.to_string() })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sent_by_host_and_port() {
        let via = parse_sent_by("SIP/2.0/UDP 192.0.2.4:5060;branch=z9hG4bKx").unwrap();
        assert_eq!(via.host, "192.0.2.4");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.received, None);
        assert_eq!(via.rport, None);
    }

    #[test]
    fn parses_received_and_stamped_rport() {
        let via = parse_sent_by("SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKx;received=203.0.113.9;rport=5070").unwrap();
        assert_eq!(via.received, Some("203.0.113.9".parse().unwrap()));
        assert_eq!(via.rport, Some(Some(5070)));
    }

    #[test]
    fn rport_wins_over_public_sent_by() {
        let via = parse_sent_by("SIP/2.0/UDP ex.com:5060;branch=z9hG4bKx;rport=5070;received=203.0.113.9").unwrap();
        let source: SocketAddr = "203.0.113.9:5070".parse().unwrap();
        let target = resolve_response_target(&via, source, false);
        assert_eq!(target, source);
    }

    #[test]
    fn public_sent_by_is_trusted_when_no_received_or_rport() {
        let via = parse_sent_by("SIP/2.0/UDP 198.51.100.2:5060;branch=z9hG4bKx").unwrap();
        let source: SocketAddr = "10.1.1.1:9999".parse().unwrap();
        let target = resolve_response_target(&via, source, false);
        assert_eq!(target, "198.51.100.2:5060".parse().unwrap());
    }

    #[test]
    fn use_source_address_overrides_everything() {
        let via = parse_sent_by("SIP/2.0/UDP 198.51.100.2:5060;branch=z9hG4bKx").unwrap();
        let source: SocketAddr = "10.1.1.1:9999".parse().unwrap();
        let target = resolve_response_target(&via, source, true);
        assert_eq!(target, source);
    }

    #[test]
    fn stamp_adds_received_for_mismatched_source() {
        let via = "SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKx;rport";
        let stamped = stamp_received_and_rport(via, "203.0.113.9:5070".parse().unwrap());
        assert!(stamped.contains("rport=5070"));
        assert!(stamped.contains("received=203.0.113.9"));
    }

    #[test]
    fn stamp_is_a_no_op_when_sent_by_already_matches_source() {
        let via = "SIP/2.0/UDP 203.0.113.9:5070;branch=z9hG4bKx";
        let stamped = stamp_received_and_rport(via, "203.0.113.9:5070".parse().unwrap());
        assert_eq!(stamped, via);
    }
}
