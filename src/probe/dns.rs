//! Host name resolution used to enrich endpoints after successful probes.

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use super::ProbeError;

/// Result of a forward lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    pub host_name: String,
    pub addresses: Vec<IpAddr>,
    /// The system resolver does not report CNAME chains, so this stays empty.
    pub aliases: Vec<String>,
}

/// Resolve `host` through the system resolver, bounded by `timeout`.
pub async fn resolve_host(host: &str, timeout: Duration) -> Result<HostEntry, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(HostEntry {
            host_name: String::new(),
            addresses: vec![ip],
            aliases: Vec::new(),
        });
    }

    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", host, e)))?;

    let mut addresses: Vec<IpAddr> = Vec::new();
    for addr in lookup {
        if !addresses.contains(&addr.ip()) {
            addresses.push(addr.ip());
        }
    }
    if addresses.is_empty() {
        return Err(ProbeError::Network(format!("No addresses found for {}", host)));
    }

    Ok(HostEntry {
        host_name: host.to_string(),
        addresses,
        aliases: Vec::new(),
    })
}
