//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ProbeDefaults;
use crate::endpoint::{Endpoint, ParseError, Protocol};

/// The persisted definition of an endpoint. Runtime state is not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: Uuid,
    pub protocol: Protocol,
    pub address_or_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group: String,
    pub enabled: bool,
    pub ping_every_seconds: f64,
    pub timeout_seconds: f64,
    pub buffer_size: usize,
    pub ttl: u8,
    #[serde(default)]
    pub dont_fragment: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Endpoint> for EndpointRecord {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            id: endpoint.id(),
            protocol: endpoint.protocol(),
            address_or_url: endpoint.address_or_url().to_string(),
            description: endpoint.description.clone(),
            group: endpoint.group.clone(),
            enabled: endpoint.enabled(),
            ping_every_seconds: endpoint.ping_interval_seconds(),
            timeout_seconds: endpoint.timeout_seconds(),
            buffer_size: endpoint.buffer_size(),
            ttl: endpoint.ttl(),
            dont_fragment: endpoint.dont_fragment(),
            created_at: endpoint.created_at(),
        }
    }
}

impl EndpointRecord {
    /// Rebuild a live endpoint. Tunables pass through the usual clamps.
    pub fn into_endpoint(self) -> Result<Endpoint, ParseError> {
        let defaults = ProbeDefaults {
            ping_every_seconds: self.ping_every_seconds,
            timeout_seconds: self.timeout_seconds,
            buffer_size: self.buffer_size,
            ttl: self.ttl,
            dont_fragment: self.dont_fragment,
        };
        let mut endpoint = Endpoint::new(self.protocol, &self.address_or_url, &defaults)?
            .with_identity(self.id, self.created_at);
        endpoint.description = self.description;
        endpoint.group = self.group;
        endpoint.set_enabled(self.enabled);
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::parse_line;

    #[test]
    fn test_record_round_trip() {
        let mut endpoint = parse_line("tcp://example.com:22,ssh,infra|10|2|0", &ProbeDefaults::default()).unwrap();
        endpoint.set_enabled(false);
        endpoint.set_ttl(32);

        let record = EndpointRecord::from(&endpoint);
        let restored = record.clone().into_endpoint().unwrap();
        assert_eq!(restored.id(), endpoint.id());
        assert_eq!(restored.created_at(), endpoint.created_at());
        assert!(restored.same_target(&endpoint));
        assert!(!restored.enabled());
        assert_eq!(restored.ttl(), 32);
        assert_eq!(EndpointRecord::from(&restored), record);
    }

    #[test]
    fn test_record_json_defaults() {
        let json = r#"{
            "id": "6f1c2f5e-8d0a-4a57-9d4e-0b6a3c1d2e3f",
            "protocol": "icmp",
            "address_or_url": "1.1.1.1",
            "enabled": true,
            "ping_every_seconds": 5.0,
            "timeout_seconds": 5.0,
            "buffer_size": 32,
            "ttl": 128,
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let record: EndpointRecord = serde_json::from_str(json).unwrap();
        assert!(record.description.is_empty());
        assert!(!record.dont_fragment);
        assert!(record.into_endpoint().is_ok());
    }
}
