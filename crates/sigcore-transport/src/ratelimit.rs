//! Per-source and aggregate packet-rate policing (`packet-rate-ratio`),
//! with a time-indexed ban list and an IP/CIDR whitelist.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ipnet::IpNet;

/// External hook invoked with a source IP the instant it is banned, when
/// `auto_null_route_on_ban` is set (§4.3/§6). Typically wired to a
/// system call that withdraws a route for that address; the core only
/// calls it, it never implements null-routing itself.
pub type NullRouteHook = Arc<dyn Fn(IpAddr) + Send + Sync>;

/// Parsed form of the `listeners.packet-rate-ratio = "violation/aggregate/banlife"`
/// configuration string.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Packets/second from a single source before it is banned.
    pub violation_rate: u32,
    /// Packets/second across all sources before new traffic is shed.
    pub aggregate_rate: u32,
    pub ban_lifetime: Duration,
    pub whitelist: Vec<IpNet>,
    pub auto_null_route_on_ban: bool,
}

impl RateLimitConfig {
    /// Parses `"violation/aggregate/banlife"`, e.g. `"50/500/60"`.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.splitn(3, '/');
        let violation_rate: u32 = parts.next()?.parse().ok()?;
        let aggregate_rate: u32 = parts.next()?.parse().ok()?;
        let banlife: u64 = parts.next()?.parse().ok()?;
        Some(RateLimitConfig {
            violation_rate,
            aggregate_rate,
            ban_lifetime: Duration::from_secs(banlife),
            whitelist: Vec::new(),
            auto_null_route_on_ban: false,
        })
    }
}

struct Window {
    started_at: Instant,
    count: u32,
}

/// Tracks per-second packet counts per source, an aggregate counter, and a
/// ban list keyed by source IP. `check` is the hot path: called once per
/// inbound datagram/frame before it reaches the parser.
pub struct RateLimiter {
    config: RateLimitConfig,
    per_source: DashMap<IpAddr, Window>,
    aggregate: DashMap<(), Window>,
    bans: DashMap<IpAddr, Instant>,
    null_route: Option<NullRouteHook>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter { config, per_source: DashMap::new(), aggregate: DashMap::new(), bans: DashMap::new(), null_route: None }
    }

    /// Installs the `null_route(ip)` hook named in §4.3. Only called for
    /// a ban when the parsed config's `auto_null_route_on_ban` is set;
    /// with no hook installed, a ban still takes effect locally but
    /// nothing external is notified.
    pub fn with_null_route_hook(mut self, hook: NullRouteHook) -> Self {
        self.null_route = Some(hook);
        self
    }

    fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.config.whitelist.iter().any(|net| net.contains(&ip))
    }

    /// Returns `true` if the packet from `source` should be processed,
    /// `false` if it should be dropped (already banned, or this packet
    /// itself trips the violation or aggregate threshold).
    pub fn admit(&self, source: IpAddr) -> bool {
        if self.is_whitelisted(source) {
            return true;
        }

        if let Some(banned_until) = self.bans.get(&source).map(|e| *e) {
            if Instant::now() < banned_until {
                return false;
            }
            self.bans.remove(&source);
        }

        let now = Instant::now();
        let violated = {
            let mut entry = self.per_source.entry(source).or_insert_with(|| Window { started_at: now, count: 0 });
            if now.duration_since(entry.started_at) >= Duration::from_secs(1) {
                entry.started_at = now;
                entry.count = 0;
            }
            entry.count += 1;
            entry.count > self.config.violation_rate
        };

        if violated {
            self.bans.insert(source, now + self.config.ban_lifetime);
            if self.config.auto_null_route_on_ban {
                if let Some(hook) = &self.null_route {
                    hook(source);
                }
            }
            return false;
        }

        let aggregate_violated = {
            let mut entry = self.aggregate.entry(()).or_insert_with(|| Window { started_at: now, count: 0 });
            if now.duration_since(entry.started_at) >= Duration::from_secs(1) {
                entry.started_at = now;
                entry.count = 0;
            }
            entry.count += 1;
            entry.count > self.config.aggregate_rate
        };

        !aggregate_violated
    }

    pub fn is_banned(&self, source: IpAddr) -> bool {
        self.bans.get(&source).map(|e| Instant::now() < *e).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn bans_a_source_that_exceeds_the_violation_rate() {
        let limiter = RateLimiter::new(RateLimitConfig::parse("50/500/60").unwrap());
        let source = ip(1);
        let mut admitted = 0;
        for _ in 0..100 {
            if limiter.admit(source) {
                admitted += 1;
            }
        }
        assert!(admitted <= 51, "expected ban after the 51st packet in the window, got {admitted} admitted");
        assert!(limiter.is_banned(source));
    }

    #[test]
    fn null_route_hook_fires_exactly_once_per_ban() {
        let mut config = RateLimitConfig::parse("5/500/60").unwrap();
        config.auto_null_route_on_ban = true;
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let limiter = RateLimiter::new(config).with_null_route_hook(Arc::new(move |ip| recorded.lock().unwrap().push(ip)));
        let source = ip(3);
        for _ in 0..20 {
            limiter.admit(source);
        }
        assert_eq!(calls.lock().unwrap().as_slice(), &[source]);
    }

    #[test]
    fn null_route_hook_is_not_called_without_auto_null_route_on_ban() {
        let config = RateLimitConfig::parse("5/500/60").unwrap();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let limiter = RateLimiter::new(config).with_null_route_hook(Arc::new(move |ip| recorded.lock().unwrap().push(ip)));
        let source = ip(4);
        for _ in 0..20 {
            limiter.admit(source);
        }
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn whitelisted_source_is_never_banned() {
        let mut config = RateLimitConfig::parse("5/500/60").unwrap();
        config.whitelist.push("10.0.0.2/32".parse().unwrap());
        let limiter = RateLimiter::new(config);
        let source = ip(2);
        for _ in 0..100 {
            assert!(limiter.admit(source));
        }
        assert!(!limiter.is_banned(source));
    }
}
