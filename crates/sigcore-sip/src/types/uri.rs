//! SIP URI representation (RFC 3261 §19.1).
//!
//! ```text
//! sip:user:password@host:port;uri-parameters?headers
//! ```
//!
//! Equality ignores the order of parameters and headers but is
//! case-insensitive on their names, matching the comparison rules of
//! RFC 3261 §19.1.4.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::Error;
use crate::parser::uri::parse_uri;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
    Custom(String),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
            Scheme::Custom(s) => s,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            "tel" => Scheme::Tel,
            _ => Scheme::Custom(s.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(d) => f.write_str(d),
            Host::Ip(IpAddr::V4(v4)) => write!(f, "{}", v4),
            Host::Ip(IpAddr::V6(v6)) => write!(f, "[{}]", v6),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct UserInfo {
    pub user: String,
    pub password: Option<String>,
}

/// An ordered name/value parameter list. A bare flag parameter like `lr`
/// stores `None` as its value.
pub type ParamList = Vec<(String, Option<String>)>;
pub type HeaderList = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct SipUri {
    pub scheme: Scheme,
    pub userinfo: Option<UserInfo>,
    pub host: Host,
    pub port: Option<u16>,
    pub params: ParamList,
    pub headers: HeaderList,
}

impl SipUri {
    pub fn sip(host: impl Into<String>) -> Self {
        SipUri {
            scheme: Scheme::Sip,
            userinfo: None,
            host: Host::Domain(host.into()),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.userinfo = Some(UserInfo { user: user.into(), password: None });
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        if let Some(entry) = self.params.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            entry.1 = value;
        } else {
            self.params.push((name, value));
        }
    }

    /// `lr` parameter presence, used when this URI sits in a Route/Record-Route set.
    pub fn is_loose_routing(&self) -> bool {
        self.param("lr").is_some()
    }

    pub fn transport(&self) -> Option<&str> {
        self.param("transport").flatten()
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(ui) = &self.userinfo {
            f.write_str(&ui.user)?;
            if let Some(pw) = &ui.password {
                write!(f, ":{}", pw)?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        if !self.headers.is_empty() {
            f.write_str("?")?;
            for (i, (name, value)) in self.headers.iter().enumerate() {
                if i > 0 {
                    f.write_str("&")?;
                }
                write!(f, "{}={}", name, value)?;
            }
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_uri(s)
    }
}

fn eq_ignore_order(a: &ParamList, b: &ParamList) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, value)| {
        b.iter().any(|(n2, v2)| n2.eq_ignore_ascii_case(name) && v2 == value)
    })
}

fn eq_headers_ignore_order(a: &HeaderList, b: &HeaderList) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, value)| {
        b.iter().any(|(n2, v2)| n2.eq_ignore_ascii_case(name) && v2 == value)
    })
}

impl PartialEq for SipUri {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.userinfo == other.userinfo
            && self.host == other.host
            && self.port == other.port
            && eq_ignore_order(&self.params, &other.params)
            && eq_headers_ignore_order(&self.headers, &other.headers)
    }
}

impl Eq for SipUri {}
