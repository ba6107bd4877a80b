//! Pingable endpoints.
//!
//! An [`Endpoint`] couples a target definition (protocol, address, tunables)
//! with its runtime state: the reply ledger, the busy flag and the DNS
//! enrichment counters.

mod parse;
mod set;

pub use parse::*;
pub use set::*;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{clamp_buffer_size, clamp_ping_every, clamp_timeout, clamp_ttl, ProbeDefaults};
use crate::ledger::Ledger;
use crate::probe::{HostEntry, Reply};

/// Number of successful probes after which DNS enrichment stops retrying.
pub const MAX_DNS_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
        }
    }

    /// Transport-level protocols honour TTL, buffer size and don't-fragment.
    pub fn supports_ttl(&self) -> bool {
        !matches!(self, Self::Http)
    }

    pub fn supports_buffer(&self) -> bool {
        !matches!(self, Self::Http)
    }

    pub fn supports_dont_fragment(&self) -> bool {
        matches!(self, Self::Icmp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "icmp" => Ok(Self::Icmp),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "http" | "https" => Ok(Self::Http),
            other => Err(ParseError::MalformedLine(format!("unknown protocol: {}", other))),
        }
    }
}

/// Resolved network target. `address` stays `None` until a host name resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResolvedEndpoint {
    pub address: Option<IpAddr>,
    pub port: u16,
}

impl ResolvedEndpoint {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// A single monitored target and its history.
#[derive(Debug, Clone)]
pub struct Endpoint {
    id: Uuid,
    protocol: Protocol,
    address_or_url: String,
    created_at: DateTime<Utc>,

    pub description: String,
    pub group: String,
    enabled: bool,

    resolved: ResolvedEndpoint,
    host_name: String,
    resolved_addresses: Vec<IpAddr>,
    aliases: Vec<String>,
    dns_resolved: bool,
    dns_attempts: u32,

    ping_interval_seconds: f64,
    timeout_seconds: f64,
    buffer_size: usize,
    ttl: u8,
    dont_fragment: bool,
    payload: Arc<[u8]>,

    busy: bool,
    last_completed_at: Option<DateTime<Utc>>,
    ledger: Ledger,
}

impl Endpoint {
    /// Build an endpoint from an explicit protocol and address.
    ///
    /// The address is normalized (trimmed, trailing slashes removed,
    /// lowercased) and validated for the protocol's shape.
    pub fn new(protocol: Protocol, address_or_url: &str, defaults: &ProbeDefaults) -> Result<Self, ParseError> {
        let mut address = address_or_url.trim().trim_end_matches('/').to_lowercase();
        if address.is_empty() {
            return Err(ParseError::MalformedLine("empty address".to_string()));
        }
        if protocol == Protocol::Http && !address.starts_with("http://") && !address.starts_with("https://") {
            address = format!("http://{}", address);
        }
        check_shape(protocol, &address)?;
        let (resolved, host_name) = resolve_literal(protocol, &address)?;

        let mut endpoint = Self {
            id: Uuid::new_v4(),
            protocol,
            address_or_url: address,
            created_at: Utc::now(),
            description: String::new(),
            group: String::new(),
            enabled: true,
            resolved,
            host_name,
            resolved_addresses: resolved.address.into_iter().collect(),
            aliases: Vec::new(),
            dns_resolved: false,
            dns_attempts: 0,
            ping_interval_seconds: 0.0,
            timeout_seconds: 0.0,
            buffer_size: 0,
            ttl: 0,
            dont_fragment: false,
            payload: create_payload(0),
            busy: false,
            last_completed_at: None,
            ledger: Ledger::new(),
        };
        endpoint.set_ping_interval_seconds(defaults.ping_every_seconds);
        endpoint.set_timeout_seconds(defaults.timeout_seconds);
        endpoint.set_buffer_size(defaults.buffer_size as i64);
        endpoint.set_ttl(defaults.ttl);
        endpoint.set_dont_fragment(defaults.dont_fragment);
        Ok(endpoint)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Restore a persisted identity and creation time.
    pub(crate) fn with_identity(mut self, id: Uuid, created_at: DateTime<Utc>) -> Self {
        self.id = id;
        self.created_at = created_at;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn address_or_url(&self) -> &str {
        &self.address_or_url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Two endpoints are duplicates when protocol and normalized address match.
    pub fn same_target(&self, other: &Endpoint) -> bool {
        self.protocol == other.protocol && self.address_or_url == other.address_or_url
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn resolved(&self) -> ResolvedEndpoint {
        self.resolved
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn resolved_addresses(&self) -> &[IpAddr] {
        &self.resolved_addresses
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn dns_resolved(&self) -> bool {
        self.dns_resolved
    }

    pub fn ping_interval_seconds(&self) -> f64 {
        self.ping_interval_seconds
    }

    /// NaN keeps the previous value.
    pub fn set_ping_interval_seconds(&mut self, seconds: f64) {
        if let Some(value) = clamp_ping_every(seconds) {
            self.ping_interval_seconds = value;
        }
    }

    pub fn timeout_seconds(&self) -> f64 {
        self.timeout_seconds
    }

    pub fn set_timeout_seconds(&mut self, seconds: f64) {
        if let Some(value) = clamp_timeout(seconds) {
            self.timeout_seconds = value;
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Clamps the size and regenerates the cached payload.
    pub fn set_buffer_size(&mut self, size: i64) {
        let size = clamp_buffer_size(size);
        if size != self.buffer_size || self.payload.len() != size {
            self.buffer_size = size;
            self.payload = create_payload(size);
        }
    }

    pub fn payload(&self) -> Arc<[u8]> {
        Arc::clone(&self.payload)
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = clamp_ttl(ttl);
    }

    pub fn dont_fragment(&self) -> bool {
        self.dont_fragment
    }

    pub fn set_dont_fragment(&mut self, dont_fragment: bool) {
        self.dont_fragment = dont_fragment;
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn last_completed_at(&self) -> Option<DateTime<Utc>> {
        self.last_completed_at
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    /// Whether the scheduler may dispatch a probe at `now`.
    ///
    /// Once the interval has elapsed the endpoint stays due until it is
    /// dispatched.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled || self.busy || self.ping_interval_seconds <= 0.0 {
            return false;
        }
        match self.last_completed_at {
            None => true,
            Some(last) => {
                let elapsed = (now - last).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0;
                elapsed >= self.ping_interval_seconds
            }
        }
    }

    /// Append a finished probe's reply and release the endpoint.
    ///
    /// Returns whether the status changed compared to the previous reply.
    pub fn complete_probe(&mut self, reply: Reply, now: DateTime<Utc>) -> bool {
        if self.resolved.address.is_none() {
            if let Some(target) = reply.target() {
                self.resolved.address = Some(target.ip());
            }
        }
        self.ledger.append(reply);
        self.busy = false;
        self.last_completed_at = Some(now);
        self.ledger.status_changed()
    }

    /// Host to hand to DNS enrichment after a successful probe, counting the attempt.
    pub fn take_dns_attempt(&mut self) -> Option<String> {
        if self.dns_resolved || self.dns_attempts >= MAX_DNS_ATTEMPTS {
            return None;
        }
        if !self.ledger.latest().is_some_and(Reply::succeeded) {
            return None;
        }
        self.dns_attempts += 1;
        Some(self.dns_host())
    }

    pub fn apply_dns(&mut self, entry: HostEntry) {
        if !entry.host_name.is_empty() {
            self.host_name = entry.host_name;
        }
        self.resolved_addresses = entry.addresses;
        self.aliases = entry.aliases;
        self.dns_resolved = true;
    }

    /// The bare host portion of the address.
    pub fn dns_host(&self) -> String {
        if !self.host_name.is_empty() {
            return self.host_name.clone();
        }
        match self.resolved.address {
            Some(ip) => ip.to_string(),
            None => self.address_or_url.clone(),
        }
    }

    /// Serialize back into the text definition format.
    ///
    /// Separator characters inside the description or group become spaces.
    pub fn to_line(&self) -> String {
        let prefix = match self.protocol {
            Protocol::Icmp => "icmp://",
            Protocol::Tcp => "tcp://",
            Protocol::Udp => "udp://",
            Protocol::Http => "",
        };
        format!(
            "{}{},{},{}|{}|{}|{}",
            prefix,
            self.address_or_url,
            self.description.replace(DESCRIPTION_RESERVED, " "),
            self.group.replace(GROUP_RESERVED, " "),
            self.ping_interval_seconds,
            self.timeout_seconds,
            self.buffer_size
        )
    }
}

/// Characters a description cannot hold in a definition line.
pub const DESCRIPTION_RESERVED: &[char] = &[',', '|', '\n', '\r'];

/// The group is the last comma field, so only `|` and line breaks split it.
pub const GROUP_RESERVED: &[char] = &['|', '\n', '\r'];

/// Deterministic filler: `'a' + i % 23`.
pub fn create_payload(size: usize) -> Arc<[u8]> {
    (0..size).map(|i| b'a' + (i % 23) as u8).collect()
}

fn check_shape(protocol: Protocol, address: &str) -> Result<(), ParseError> {
    match protocol {
        Protocol::Icmp => {
            if address.contains('/') {
                return Err(ParseError::MalformedLine(format!("icmp address must not contain a path: {}", address)));
            }
            if address.contains(':') && address.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(ParseError::MalformedLine(format!(
                    "icmp address must not contain a port number: {}",
                    address
                )));
            }
        }
        Protocol::Tcp | Protocol::Udp => {
            if address.contains('/') {
                return Err(ParseError::MalformedLine(format!(
                    "{} address must not contain a path: {}",
                    protocol, address
                )));
            }
            if !address.contains(':') {
                return Err(ParseError::MalformedLine(format!(
                    "{} address must contain a port number: {}",
                    protocol, address
                )));
            }
        }
        Protocol::Http => {}
    }
    Ok(())
}

/// Resolve IP literals immediately; domain names are left for DNS.
fn resolve_literal(protocol: Protocol, address: &str) -> Result<(ResolvedEndpoint, String), ParseError> {
    let invalid = || ParseError::InvalidAddress(address.to_string());
    match protocol {
        Protocol::Icmp => {
            if let Ok(ip) = address.parse::<IpAddr>() {
                return Ok((ResolvedEndpoint { address: Some(ip), port: 0 }, String::new()));
            }
            host_endpoint(address, 0).ok_or_else(invalid)
        }
        Protocol::Tcp | Protocol::Udp => {
            if let Ok(addr) = address.parse::<SocketAddr>() {
                return Ok((ResolvedEndpoint { address: Some(addr.ip()), port: addr.port() }, String::new()));
            }
            let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
            let port: u16 = port.parse().map_err(|_| invalid())?;
            host_endpoint(host, port).ok_or_else(invalid)
        }
        Protocol::Http => {
            let url = url::Url::parse(address).map_err(|_| invalid())?;
            let port = url.port_or_known_default().unwrap_or(80);
            match url.host() {
                Some(url::Host::Domain(domain)) => Ok((ResolvedEndpoint { address: None, port }, domain.to_string())),
                Some(url::Host::Ipv4(ip)) => Ok((ResolvedEndpoint { address: Some(IpAddr::V4(ip)), port }, String::new())),
                Some(url::Host::Ipv6(ip)) => Ok((ResolvedEndpoint { address: Some(IpAddr::V6(ip)), port }, String::new())),
                None => Err(invalid()),
            }
        }
    }
}

fn host_endpoint(host: &str, port: u16) -> Option<(ResolvedEndpoint, String)> {
    match url::Host::parse(host).ok()? {
        url::Host::Domain(domain) => Some((ResolvedEndpoint { address: None, port }, domain)),
        url::Host::Ipv4(ip) => Some((ResolvedEndpoint { address: Some(IpAddr::V4(ip)), port }, String::new())),
        url::Host::Ipv6(ip) => Some((ResolvedEndpoint { address: Some(IpAddr::V6(ip)), port }, String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ReplyDetail, ReplyStatus};
    use chrono::Duration as ChronoDuration;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn endpoint(protocol: Protocol, address: &str) -> Endpoint {
        Endpoint::new(protocol, address, &ProbeDefaults::default()).unwrap()
    }

    #[test]
    fn test_new_applies_defaults() {
        let ep = endpoint(Protocol::Icmp, "8.8.8.8");
        assert_eq!(ep.ping_interval_seconds(), 5.0);
        assert_eq!(ep.timeout_seconds(), 5.0);
        assert_eq!(ep.buffer_size(), 32);
        assert_eq!(ep.ttl(), 128);
        assert_eq!(ep.payload().len(), 32);
        assert_eq!(ep.resolved().address, Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn test_http_address_gets_scheme() {
        let ep = endpoint(Protocol::Http, "Example.com/");
        assert_eq!(ep.address_or_url(), "http://example.com");
        assert_eq!(ep.host_name(), "example.com");
        assert_eq!(ep.resolved().port, 80);
        assert!(ep.resolved().address.is_none());
    }

    #[test]
    fn test_tunables_clamped() {
        let mut ep = endpoint(Protocol::Tcp, "localhost:80");
        ep.set_ping_interval_seconds(0.1);
        assert_eq!(ep.ping_interval_seconds(), 0.5);
        ep.set_timeout_seconds(0.0);
        assert_eq!(ep.timeout_seconds(), 0.1);
        ep.set_timeout_seconds(f64::NAN);
        assert_eq!(ep.timeout_seconds(), 0.1);
        ep.set_buffer_size(70_000);
        assert_eq!(ep.buffer_size(), 65_500);
        assert_eq!(ep.payload().len(), 65_500);
        ep.set_buffer_size(-4);
        assert_eq!(ep.buffer_size(), 0);
        ep.set_ttl(0);
        assert_eq!(ep.ttl(), 1);
    }

    #[test]
    fn test_payload_pattern() {
        let payload = create_payload(25);
        assert_eq!(payload[0], b'a');
        assert_eq!(payload[22], b'w');
        assert_eq!(payload[23], b'a');
        assert_eq!(payload[24], b'b');
    }

    #[test]
    fn test_icmp_rejects_port() {
        let err = Endpoint::new(Protocol::Icmp, "8.8.8.8:53", &ProbeDefaults::default()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedLine(_)));
        assert!(Endpoint::new(Protocol::Icmp, "2001:db8::1", &ProbeDefaults::default()).is_ok());
    }

    #[test]
    fn test_tcp_requires_valid_port() {
        let err = Endpoint::new(Protocol::Tcp, "example.com", &ProbeDefaults::default()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedLine(_)));
        let err = Endpoint::new(Protocol::Tcp, "example.com:99999", &ProbeDefaults::default()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidAddress(_)));
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        let mut ep = endpoint(Protocol::Icmp, "127.0.0.1");
        ep.set_ping_interval_seconds(2.0);
        assert!(ep.is_due(now));

        ep.set_busy(true);
        assert!(!ep.is_due(now));

        let reply = Reply::success(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            now,
            Duration::from_millis(1),
            ReplyDetail::None,
        );
        ep.complete_probe(reply, now);
        assert!(!ep.is_busy());
        assert!(!ep.is_due(now + ChronoDuration::milliseconds(1_999)));
        assert!(ep.is_due(now + ChronoDuration::seconds(2)));
        // stays due until dispatched
        assert!(ep.is_due(now + ChronoDuration::seconds(60)));

        ep.set_enabled(false);
        assert!(!ep.is_due(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn test_dns_attempts_capped() {
        let now = Utc::now();
        let mut ep = endpoint(Protocol::Icmp, "example.com");
        assert!(ep.take_dns_attempt().is_none());

        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 0);
        ep.complete_probe(Reply::success(target, now, Duration::ZERO, ReplyDetail::None), now);
        assert_eq!(ep.resolved().address, Some(target.ip()));

        for _ in 0..MAX_DNS_ATTEMPTS {
            assert_eq!(ep.take_dns_attempt().as_deref(), Some("example.com"));
        }
        assert!(ep.take_dns_attempt().is_none());
    }

    #[test]
    fn test_apply_dns_stops_enrichment() {
        let now = Utc::now();
        let mut ep = endpoint(Protocol::Icmp, "example.com");
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        ep.complete_probe(Reply::success(target, now, Duration::ZERO, ReplyDetail::None), now);
        ep.apply_dns(HostEntry {
            host_name: "example.com".to_string(),
            addresses: vec![target.ip()],
            aliases: Vec::new(),
        });
        assert!(ep.dns_resolved());
        assert!(ep.take_dns_attempt().is_none());
    }

    #[test]
    fn test_status_changed_from_complete() {
        let now = Utc::now();
        let mut ep = endpoint(Protocol::Icmp, "127.0.0.1");
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        assert!(ep.complete_probe(Reply::success(target, now, Duration::ZERO, ReplyDetail::None), now));
        assert!(!ep.complete_probe(Reply::success(target, now, Duration::ZERO, ReplyDetail::None), now));
        assert!(ep.complete_probe(Reply::timed_out(Some(target), now, Duration::from_secs(1)), now));
        assert_eq!(ep.ledger().latest().map(Reply::status), Some(ReplyStatus::TimedOut));
    }
}
