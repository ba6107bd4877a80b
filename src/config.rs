//! Configuration module for reachwatch.
//!
//! Loads configuration from environment variables with sensible defaults.
//! The daemon's CLI flags are applied on top of the loaded values.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MIN_PING_EVERY_SECONDS: f64 = 0.5;
pub const MAX_PING_EVERY_SECONDS: f64 = i32::MAX as f64;
pub const DEFAULT_PING_EVERY_SECONDS: f64 = 5.0;

pub const MIN_TIMEOUT_SECONDS: f64 = 0.1;
pub const MAX_TIMEOUT_SECONDS: f64 = i32::MAX as f64;
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 5.0;

pub const MIN_BUFFER_SIZE: usize = 0;
pub const MAX_BUFFER_SIZE: usize = 65_500;
pub const DEFAULT_BUFFER_SIZE: usize = 32;

pub const DEFAULT_TTL: u8 = 128;

/// Clamp a ping interval into its legal range, rounded to two decimals.
///
/// Non-finite input yields `None` so callers can keep their previous value.
pub fn clamp_ping_every(seconds: f64) -> Option<f64> {
    clamp_seconds(seconds, MIN_PING_EVERY_SECONDS, MAX_PING_EVERY_SECONDS)
}

/// Clamp a timeout into its legal range, rounded to two decimals.
pub fn clamp_timeout(seconds: f64) -> Option<f64> {
    clamp_seconds(seconds, MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS)
}

pub fn clamp_buffer_size(size: i64) -> usize {
    size.clamp(MIN_BUFFER_SIZE as i64, MAX_BUFFER_SIZE as i64) as usize
}

pub fn clamp_ttl(ttl: u8) -> u8 {
    ttl.max(1)
}

fn clamp_seconds(seconds: f64, min: f64, max: f64) -> Option<f64> {
    if seconds.is_nan() {
        return None;
    }
    Some(round2(seconds.clamp(min, max)))
}

/// Round half away from zero to two decimals.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    (value * 100.0).round() / 100.0
}

/// Tunables applied to endpoints whose definition omits them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeDefaults {
    pub ping_every_seconds: f64,
    pub timeout_seconds: f64,
    pub buffer_size: usize,
    pub ttl: u8,
    pub dont_fragment: bool,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self {
            ping_every_seconds: DEFAULT_PING_EVERY_SECONDS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ttl: DEFAULT_TTL,
            dont_fragment: false,
        }
    }
}

/// Which HTTP status codes count as a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpSuccessPolicy {
    /// 200..=299, redirects are followed.
    #[default]
    Success,
    /// 200..=399, redirects are not followed so 3xx is observed as-is.
    SuccessOrRedirect,
}

impl HttpSuccessPolicy {
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            Self::Success => (200..300).contains(&status),
            Self::SuccessOrRedirect => (200..400).contains(&status),
        }
    }

    pub fn follows_redirects(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl FromStr for HttpSuccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2xx" | "success" => Ok(Self::Success),
            "2xx3xx" | "redirect" | "success_or_redirect" => Ok(Self::SuccessOrRedirect),
            other => Err(format!("unknown http success policy: {}", other)),
        }
    }
}

/// Monitor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// HTTP port for the JSON API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "reachwatch.db")
    pub db_path: String,
    /// Scheduler tick cadence (default: 500ms)
    pub tick_interval: Duration,
    /// Maximum concurrent probes per tick, `None` lets the runtime decide
    pub max_parallelism: Option<usize>,
    /// Persist full reply history, not only endpoint definitions
    pub resilient_history: bool,
    /// Retention cap per ledger, 0 keeps everything
    pub max_replies: usize,
    /// Period of the reply history flush (default: 60s)
    pub history_save_interval: Duration,
    /// Debounce applied to endpoint definition saves (default: 1s)
    pub save_debounce: Duration,
    pub http_success: HttpSuccessPolicy,
    pub defaults: ProbeDefaults,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "reachwatch.db".to_string(),
            tick_interval: Duration::from_millis(500),
            max_parallelism: None,
            resilient_history: false,
            max_replies: 1_000,
            history_save_interval: Duration::from_secs(60),
            save_debounce: Duration::from_millis(1_000),
            http_success: HttpSuccessPolicy::default(),
            defaults: ProbeDefaults::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `REACHWATCH_HTTP_PORT`, `REACHWATCH_DB_PATH`
    /// - `REACHWATCH_TICK_MS`, `REACHWATCH_MAX_PARALLELISM` (0 = runtime decides)
    /// - `REACHWATCH_RESILIENT_HISTORY`, `REACHWATCH_MAX_REPLIES`
    /// - `REACHWATCH_HISTORY_SAVE_SECS`, `REACHWATCH_SAVE_DEBOUNCE_MS`
    /// - `REACHWATCH_HTTP_SUCCESS` (`2xx` or `2xx3xx`)
    /// - `REACHWATCH_DEFAULT_PING_EVERY`, `REACHWATCH_DEFAULT_TIMEOUT`,
    ///   `REACHWATCH_DEFAULT_BUFFER_SIZE`, `REACHWATCH_DEFAULT_TTL`,
    ///   `REACHWATCH_DEFAULT_DONT_FRAGMENT`
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let parsed = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(port) = parsed("REACHWATCH_HTTP_PORT").and_then(|v| v.parse().ok()) {
            cfg.http_port = port;
        }
        if let Some(db_path) = parsed("REACHWATCH_DB_PATH").filter(|v| !v.is_empty()) {
            cfg.db_path = db_path;
        }
        if let Some(ms) = parsed("REACHWATCH_TICK_MS").and_then(|v| v.parse::<u64>().ok()) {
            cfg.tick_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(n) = parsed("REACHWATCH_MAX_PARALLELISM").and_then(|v| v.parse::<usize>().ok()) {
            cfg.max_parallelism = (n > 0).then_some(n);
        }
        if let Some(flag) = parsed("REACHWATCH_RESILIENT_HISTORY").and_then(|v| parse_bool(&v)) {
            cfg.resilient_history = flag;
        }
        if let Some(n) = parsed("REACHWATCH_MAX_REPLIES").and_then(|v| v.parse().ok()) {
            cfg.max_replies = n;
        }
        if let Some(secs) = parsed("REACHWATCH_HISTORY_SAVE_SECS").and_then(|v| v.parse::<u64>().ok()) {
            cfg.history_save_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parsed("REACHWATCH_SAVE_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            cfg.save_debounce = Duration::from_millis(ms);
        }
        if let Some(policy) = parsed("REACHWATCH_HTTP_SUCCESS").and_then(|v| v.parse().ok()) {
            cfg.http_success = policy;
        }

        let defaults = &mut cfg.defaults;
        if let Some(v) = parsed("REACHWATCH_DEFAULT_PING_EVERY")
            .and_then(|v| v.parse().ok())
            .and_then(clamp_ping_every)
        {
            defaults.ping_every_seconds = v;
        }
        if let Some(v) = parsed("REACHWATCH_DEFAULT_TIMEOUT")
            .and_then(|v| v.parse().ok())
            .and_then(clamp_timeout)
        {
            defaults.timeout_seconds = v;
        }
        if let Some(v) = parsed("REACHWATCH_DEFAULT_BUFFER_SIZE").and_then(|v| v.parse::<i64>().ok()) {
            defaults.buffer_size = clamp_buffer_size(v);
        }
        if let Some(v) = parsed("REACHWATCH_DEFAULT_TTL").and_then(|v| v.parse::<u8>().ok()) {
            defaults.ttl = clamp_ttl(v);
        }
        if let Some(v) = parsed("REACHWATCH_DEFAULT_DONT_FRAGMENT").and_then(|v| parse_bool(&v)) {
            defaults.dont_fragment = v;
        }

        cfg
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
