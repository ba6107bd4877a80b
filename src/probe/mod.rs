//! Probe module for reachability monitoring.
//!
//! Supports ICMP echo, TCP connect, UDP send and HTTP GET probes. Every
//! probe resolves to a [`Reply`]; errors never escape [`Prober::probe`].

mod dns;
mod http;
mod ping;
mod reply;
mod socket;

pub use dns::*;
pub use reply::*;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{HttpSuccessPolicy, DEFAULT_TTL};
use crate::endpoint::{Endpoint, Protocol};

/// Probe error types. Folded into a failed [`Reply`] at the prober boundary.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("http error: {message}")]
    Http { kind: HttpErrorKind, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    pub fn status(&self) -> ReplyStatus {
        match self {
            Self::Timeout(_) => ReplyStatus::TimedOut,
            Self::Socket(e) if e.kind() == std::io::ErrorKind::TimedOut => ReplyStatus::TimedOut,
            Self::Socket(e) => e.raw_os_error().map(ReplyStatus::Socket).unwrap_or(ReplyStatus::Error),
            Self::Http { kind, .. } => ReplyStatus::HttpError(*kind),
            Self::Network(_) | Self::Config(_) | Self::Command(_) => ReplyStatus::Error,
        }
    }
}

/// Snapshot of everything a probe needs, taken under the endpoint lock.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub protocol: Protocol,
    pub address_or_url: String,
    /// Host name, or the IP literal when the address is one.
    pub host: String,
    pub address: Option<IpAddr>,
    pub port: u16,
    pub payload: Arc<[u8]>,
    pub ttl: u8,
    pub dont_fragment: bool,
}

impl ProbeTarget {
    /// Best known contacted endpoint, used on failure replies.
    pub fn socket_hint(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// True when neither TTL nor don't-fragment departs from the OS defaults.
    pub fn uses_default_icmp_options(&self) -> bool {
        self.ttl == DEFAULT_TTL && !self.dont_fragment
    }
}

impl From<&Endpoint> for ProbeTarget {
    fn from(endpoint: &Endpoint) -> Self {
        let resolved = endpoint.resolved();
        let host = match url::Url::parse(endpoint.address_or_url()) {
            Ok(url) if endpoint.protocol() == Protocol::Http => url.host_str().unwrap_or_default().to_string(),
            _ => endpoint.dns_host(),
        };
        Self {
            protocol: endpoint.protocol(),
            address_or_url: endpoint.address_or_url().to_string(),
            host,
            address: resolved.address,
            port: resolved.port,
            payload: endpoint.payload(),
            ttl: endpoint.ttl(),
            dont_fragment: endpoint.dont_fragment(),
        }
    }
}

/// Executes single probes. Cheap to clone; the HTTP client is shared.
#[derive(Clone)]
pub struct Prober {
    client: reqwest::Client,
    http_success: HttpSuccessPolicy,
}

impl Prober {
    pub fn new(http_success: HttpSuccessPolicy) -> Result<Self, ProbeError> {
        let redirect = if http_success.follows_redirects() {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .redirect(redirect)
            .user_agent(concat!("reachwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self { client, http_success })
    }

    /// Run one probe. Always returns a terminal reply within `timeout` plus
    /// scheduling overhead, or as soon as `cancel` fires.
    pub async fn probe(&self, target: &ProbeTarget, timeout: Duration, cancel: &CancellationToken) -> Reply {
        let sent_at = Utc::now();
        let start = Instant::now();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Reply::cancelled(target.socket_hint(), sent_at),
            outcome = tokio::time::timeout(timeout, self.dispatch(target, timeout, sent_at)) => match outcome {
                Ok(Ok(reply)) => reply,
                Ok(Err(ProbeError::Timeout(_))) | Err(_) => Reply::timed_out(target.socket_hint(), sent_at, timeout),
                Ok(Err(e)) => {
                    tracing::debug!("{} probe of {} failed: {}", target.protocol, target.address_or_url, e);
                    let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
                    Reply::failure(e.status(), target.socket_hint(), sent_at, elapsed_ms, e.to_string())
                }
            },
        }
    }

    async fn dispatch(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        sent_at: DateTime<Utc>,
    ) -> Result<Reply, ProbeError> {
        match target.protocol {
            Protocol::Icmp => ping::run_ping_probe(target, timeout, sent_at).await,
            Protocol::Tcp => socket::run_tcp_probe(target, sent_at).await,
            Protocol::Udp => socket::run_udp_probe(target, sent_at).await,
            Protocol::Http => http::run_http_probe(&self.client, self.http_success, target, sent_at).await,
        }
    }
}

/// Resolve the target to a socket address, using the cached IP when known.
pub(crate) async fn resolve_target(target: &ProbeTarget) -> Result<SocketAddr, ProbeError> {
    if let Some(addr) = target.socket_hint() {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", target.host, e)))?
        .collect();
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", target.host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeDefaults;
    use crate::endpoint::parse_line;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ProbeError::Timeout(Duration::from_secs(1)).status(), ReplyStatus::TimedOut);
        let refused = std::io::Error::from_raw_os_error(111);
        assert_eq!(ProbeError::Socket(refused).status(), ReplyStatus::Socket(111));
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(ProbeError::Socket(timed_out).status(), ReplyStatus::TimedOut);
        let http = ProbeError::Http { kind: HttpErrorKind::Connect, message: "refused".into() };
        assert_eq!(http.status(), ReplyStatus::HttpError(HttpErrorKind::Connect));
        assert_eq!(ProbeError::Command("x".into()).status(), ReplyStatus::Error);
    }

    #[test]
    fn test_target_from_endpoint() {
        let defaults = ProbeDefaults::default();
        let ep = parse_line("https://example.com:8443/health|1|1|0", &defaults).unwrap();
        let target = ProbeTarget::from(&ep);
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 8443);
        assert!(target.socket_hint().is_none());

        let ep = parse_line("tcp://127.0.0.1:22", &defaults).unwrap();
        let target = ProbeTarget::from(&ep);
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.socket_hint(), Some("127.0.0.1:22".parse().unwrap()));
        assert_eq!(target.payload.len(), 32);
        assert!(target.uses_default_icmp_options());

        let mut ep = parse_line("8.8.8.8", &defaults).unwrap();
        ep.set_dont_fragment(true);
        assert!(!ProbeTarget::from(&ep).uses_default_icmp_options());
    }

    #[tokio::test]
    async fn test_cancelled_probe_resolves() {
        let prober = Prober::new(HttpSuccessPolicy::Success).unwrap();
        let ep = parse_line("tcp://127.0.0.1:9", &ProbeDefaults::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reply = prober.probe(&ProbeTarget::from(&ep), Duration::from_secs(5), &cancel).await;
        assert_eq!(reply.status(), ReplyStatus::Cancelled);
        assert!(reply.failed());
    }

    #[tokio::test]
    async fn test_unreachable_probe_does_not_hang() {
        let prober = Prober::new(HttpSuccessPolicy::Success).unwrap();
        // TEST-NET-1, never routed
        let ep = parse_line("tcp://192.0.2.1:81", &ProbeDefaults::default()).unwrap();
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let reply = prober
            .probe(&ProbeTarget::from(&ep), timeout, &CancellationToken::new())
            .await;
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
        assert!(reply.failed());
    }
}
