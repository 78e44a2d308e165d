//! nom-based parser for [`SipUri`](crate::types::uri::SipUri).

use std::net::IpAddr;
use std::str::FromStr;

use nom::{
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{char, digit1},
    combinator::{opt, recognize},
    multi::many0,
    sequence::{pair, preceded},
    IResult,
};

use crate::error::Error;
use crate::types::uri::{Host, Scheme, SipUri, UserInfo};

fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'
}

fn scheme(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        nom::character::complete::satisfy(|c| c.is_ascii_alphabetic()),
        take_while1(is_scheme_char),
    ))(input)
}

fn is_userinfo_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_.!~*'()&=+$,;?/%".contains(c)
}

fn userinfo(input: &str) -> IResult<&str, UserInfo> {
    let (rest, user) = take_till1(|c| c == ':' || c == '@')(input)?;
    let (rest, password) = opt(preceded(char(':'), take_till1(|c| c == '@')))(rest)?;
    let (rest, _) = char('@')(rest)?;
    Ok((rest, UserInfo { user: user.to_string(), password: password.map(str::to_string) }))
}

fn ipv6_host(input: &str) -> IResult<&str, Host> {
    let (rest, inner) = nom::sequence::delimited(char('['), take_till1(|c| c == ']'), char(']'))(input)?;
    let ip: std::net::Ipv6Addr = inner
        .parse()
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((rest, Host::Ip(IpAddr::V6(ip))))
}

fn is_domain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
}

fn domain_or_ipv4_host(input: &str) -> IResult<&str, Host> {
    let (rest, text) = take_while1(is_domain_char)(input)?;
    if let Ok(v4) = text.parse::<std::net::Ipv4Addr>() {
        Ok((rest, Host::Ip(IpAddr::V4(v4))))
    } else {
        Ok((rest, Host::Domain(text.to_string())))
    }
}

fn host(input: &str) -> IResult<&str, Host> {
    nom::branch::alt((ipv6_host, domain_or_ipv4_host))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    let (rest, digits) = preceded(char(':'), digit1)(input)?;
    let value = digits
        .parse::<u16>()
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((rest, value))
}

fn is_param_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_.!~*'()[]/:&+$".contains(c)
}

fn param(input: &str) -> IResult<&str, (String, Option<String>)> {
    let (rest, _) = char(';')(input)?;
    let (rest, name) = take_while1(is_param_char)(rest)?;
    let (rest, value) = opt(preceded(char('='), take_while1(is_param_char)))(rest)?;
    Ok((rest, (name.to_string(), value.map(str::to_string))))
}

fn header(input: &str) -> IResult<&str, (String, String)> {
    let (rest, name) = take_while1(|c: char| c != '=' && c != '&')(input)?;
    let (rest, _) = char('=')(rest)?;
    let (rest, value) = take_while1(|c: char| c != '&')(rest)?;
    Ok((rest, (name.to_string(), value.to_string())))
}

fn headers(input: &str) -> IResult<&str, Vec<(String, String)>> {
    let (rest, _) = char('?')(input)?;
    let (rest, first) = header(rest)?;
    let (rest, mut tail) = many0(preceded(char('&'), header))(rest)?;
    let mut out = vec![first];
    out.append(&mut tail);
    Ok((rest, out))
}

/// Parses a SIP/SIPS/TEL URI, returning `Error::InvalidUri` on syntax failure.
pub fn parse_uri(input: &str) -> Result<SipUri, Error> {
    let (rest, scheme_str) = scheme(input).map_err(|_| Error::InvalidUri(input.to_string()))?;
    let (rest, _) = tag::<_, _, nom::error::Error<&str>>(":")(rest)
        .map_err(|_| Error::InvalidUri(input.to_string()))?;
    let scheme = Scheme::from_str(scheme_str)?;

    let (rest, userinfo) = opt(userinfo)(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| {
        Error::MalformedUriComponent { component: "userinfo".into(), message: input.to_string() }
    })?;
    let (rest, host) = host(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| {
        Error::MalformedUriComponent { component: "host".into(), message: input.to_string() }
    })?;
    let (rest, port) = opt(port)(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| {
        Error::MalformedUriComponent { component: "port".into(), message: input.to_string() }
    })?;
    let (rest, params) = many0(param)(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| {
        Error::MalformedUriComponent { component: "params".into(), message: input.to_string() }
    })?;
    let (rest, headers) = opt(headers)(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| {
        Error::MalformedUriComponent { component: "headers".into(), message: input.to_string() }
    })?;

    if !rest.is_empty() {
        return Err(Error::InvalidUri(input.to_string()));
    }

    Ok(SipUri { scheme, userinfo, host, port, params, headers: headers.unwrap_or_default() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_sip_uri() {
        let uri = parse_uri("sip:alice@example.com:5060;transport=udp").unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.userinfo.as_ref().unwrap().user, "alice");
        assert_eq!(uri.host, Host::Domain("example.com".to_string()));
        assert_eq!(uri.port, Some(5060));
        assert_eq!(uri.transport(), Some("udp"));
    }

    #[test]
    fn parses_ipv6_host() {
        let uri = parse_uri("sip:bob@[2001:db8::1]:5061").unwrap();
        assert_eq!(uri.host, Host::Ip("2001:db8::1".parse().unwrap()));
        assert_eq!(uri.port, Some(5061));
    }

    #[test]
    fn round_trips_display() {
        let uri = parse_uri("sip:alice@example.com;lr").unwrap();
        assert!(uri.is_loose_routing());
        let rendered = uri.to_string();
        let reparsed = parse_uri(&rendered).unwrap();
        assert_eq!(uri, reparsed);
    }

    #[test]
    fn equality_ignores_param_order() {
        let a = parse_uri("sip:a@b;x=1;y=2").unwrap();
        let b = parse_uri("sip:a@b;y=2;x=1").unwrap();
        assert_eq!(a, b);
    }
}
