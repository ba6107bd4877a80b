//! Text definition format for endpoints.
//!
//! One endpoint per line:
//!
//! ```text
//! [scheme://]address[,description[,group]][|ping_every[|timeout[|buffer_size]]]
//! ```
//!
//! Without a scheme, an address containing `/` is HTTP and anything else is
//! ICMP. Numeric fields that fail to parse fall back to the defaults.

use thiserror::Error;

use super::{Endpoint, Protocol};
use crate::config::ProbeDefaults;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed line: {0}")]
    MalformedLine(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A line that could not be turned into an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFailure {
    /// 1-based line number within the parsed text.
    pub line_number: usize,
    pub line: String,
    pub error: ParseError,
}

#[derive(Debug, Default)]
pub struct ParseReport {
    pub endpoints: Vec<Endpoint>,
    pub failures: Vec<LineFailure>,
}

const SCHEMES: [(&str, Protocol); 4] = [
    ("icmp://", Protocol::Icmp),
    ("tcp://", Protocol::Tcp),
    ("udp://", Protocol::Udp),
    ("http://", Protocol::Http),
];

/// Parse a single endpoint definition line.
pub fn parse_line(line: &str, defaults: &ProbeDefaults) -> Result<Endpoint, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::MalformedLine("empty line".to_string()));
    }

    let mut fields = line.split('|');
    let head = fields.next().unwrap_or_default();
    let mut head_parts = head.splitn(3, ',');
    let address = head_parts.next().unwrap_or_default().trim().to_lowercase();
    let description = head_parts.next().unwrap_or_default().trim().to_string();
    let group = head_parts.next().unwrap_or_default().trim().to_string();

    let (protocol, address) = split_scheme(&address)?;
    let mut endpoint = Endpoint::new(protocol, &address, defaults)?;
    endpoint.description = description;
    endpoint.group = group;

    endpoint.set_ping_interval_seconds(numeric(fields.next()).unwrap_or(defaults.ping_every_seconds));
    endpoint.set_timeout_seconds(numeric(fields.next()).unwrap_or(defaults.timeout_seconds));
    endpoint.set_buffer_size(
        fields
            .next()
            .and_then(|field| field.trim().parse::<i64>().ok())
            .unwrap_or(defaults.buffer_size as i64),
    );

    Ok(endpoint)
}

/// Parse many lines, skipping blanks and `#` comments.
///
/// Failures are collected instead of aborting the whole batch.
pub fn parse_many(text: &str, defaults: &ProbeDefaults) -> ParseReport {
    let mut report = ParseReport::default();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_line(trimmed, defaults) {
            Ok(endpoint) => report.endpoints.push(endpoint),
            Err(error) => {
                tracing::debug!("Skipping line {}: {}", index + 1, error);
                report.failures.push(LineFailure {
                    line_number: index + 1,
                    line: trimmed.to_string(),
                    error,
                });
            }
        }
    }
    report
}

fn split_scheme(address: &str) -> Result<(Protocol, String), ParseError> {
    if address.starts_with("https://") {
        return Ok((Protocol::Http, address.to_string()));
    }
    for (scheme, protocol) in SCHEMES {
        if let Some(rest) = address.strip_prefix(scheme) {
            let rest = if protocol == Protocol::Http { address } else { rest };
            return Ok((protocol, rest.to_string()));
        }
    }
    if let Some((scheme, _)) = address.split_once("://") {
        return Err(ParseError::MalformedLine(format!("unsupported scheme: {}", scheme)));
    }
    if address.contains('/') {
        Ok((Protocol::Http, address.to_string()))
    } else {
        Ok((Protocol::Icmp, address.to_string()))
    }
}

fn numeric(field: Option<&str>) -> Option<f64> {
    field.and_then(|f| f.trim().parse::<f64>().ok())
}
