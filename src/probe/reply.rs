//! Probe reply types.
//!
//! A [`Reply`] is immutable once built. Its constructors guarantee that
//! `succeeded` and `status` agree: only [`Reply::success`], a successful
//! [`Reply::icmp`] or an accepted [`Reply::http`] can produce a success.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::round2;

/// Outcome of an ICMP echo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcmpStatus {
    Success,
    DestinationUnreachable,
    TtlExpired,
    ParameterProblem,
    BadReply,
}

impl IcmpStatus {
    /// ICMPv4 message type that produced this status.
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::DestinationUnreachable => 3,
            Self::TtlExpired => 11,
            Self::ParameterProblem => 12,
            Self::BadReply => -5,
        }
    }
}

/// Classification of an HTTP transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpErrorKind {
    Builder,
    Connect,
    Redirect,
    Request,
    Body,
    Decode,
    Other,
}

/// Protocol-specific outcome code of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Baseline before any probe completed.
    Unknown,
    Success,
    TimedOut,
    Cancelled,
    Error,
    Icmp(IcmpStatus),
    /// OS socket error number.
    Socket(i32),
    Http(u16),
    HttpError(HttpErrorKind),
}

impl ReplyStatus {
    /// Integer status code, the value exported in the `StatusCode` column.
    pub fn code(&self) -> i32 {
        match self {
            Self::Unknown => -1,
            Self::Success => 0,
            Self::TimedOut => -2,
            Self::Cancelled => -3,
            Self::Error => -4,
            Self::Icmp(status) => status.code(),
            Self::Socket(errno) => *errno,
            Self::Http(code) => i32::from(*code),
            Self::HttpError(kind) => -100 - *kind as i32,
        }
    }

    /// Statuses that can never accompany a successful reply.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::Success | Self::Http(_) => false,
            Self::Icmp(status) => *status != IcmpStatus::Success,
            _ => true,
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Success => write!(f, "Success"),
            Self::TimedOut => write!(f, "TimedOut"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Error => write!(f, "Error"),
            Self::Icmp(status) => write!(f, "{:?}", status),
            Self::Socket(errno) => write!(f, "SocketError({})", errno),
            Self::Http(code) => write!(f, "Http{}", code),
            Self::HttpError(kind) => write!(f, "Http{:?}Error", kind),
        }
    }
}

/// Protocol-specific extras carried by a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ReplyDetail {
    None,
    Icmp { buffer_len: usize, ttl: Option<u8> },
    Socket { bytes_sent: usize, ttl: u8 },
    Http { response_size: u64 },
}

/// The outcome of one completed probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    succeeded: bool,
    status: ReplyStatus,
    target: Option<SocketAddr>,
    sent_at: DateTime<Utc>,
    /// Milliseconds, `+inf` when no meaningful duration exists.
    #[serde(serialize_with = "serialize_elapsed")]
    elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    detail: ReplyDetail,
}

impl Reply {
    /// A completed TCP connect or UDP send.
    pub fn success(
        target: SocketAddr,
        sent_at: DateTime<Utc>,
        elapsed: Duration,
        detail: ReplyDetail,
    ) -> Self {
        Self::build(true, ReplyStatus::Success, Some(target), sent_at, duration_ms(elapsed), None, detail)
    }

    /// An ICMP answer; only [`IcmpStatus::Success`] counts as success.
    pub fn icmp(
        status: IcmpStatus,
        target: Option<SocketAddr>,
        sent_at: DateTime<Utc>,
        elapsed: Duration,
        detail: ReplyDetail,
    ) -> Self {
        let succeeded = status == IcmpStatus::Success;
        let error_message = (!succeeded).then(|| format!("icmp reply: {:?}", status));
        Self::build(
            succeeded,
            ReplyStatus::Icmp(status),
            target,
            sent_at,
            duration_ms(elapsed),
            error_message,
            detail,
        )
    }

    /// An HTTP response; `accepted` is the caller's success policy verdict.
    pub fn http(
        status_code: u16,
        accepted: bool,
        target: Option<SocketAddr>,
        sent_at: DateTime<Utc>,
        elapsed: Duration,
        response_size: u64,
    ) -> Self {
        let error_message = (!accepted).then(|| format!("http status {}", status_code));
        Self::build(
            accepted,
            ReplyStatus::Http(status_code),
            target,
            sent_at,
            duration_ms(elapsed),
            error_message,
            ReplyDetail::Http { response_size },
        )
    }

    /// A failed probe. Always `succeeded == false`, whatever the status.
    pub fn failure(
        status: ReplyStatus,
        target: Option<SocketAddr>,
        sent_at: DateTime<Utc>,
        elapsed_ms: f64,
        message: impl Into<String>,
    ) -> Self {
        Self::build(false, status, target, sent_at, elapsed_ms, Some(message.into()), ReplyDetail::None)
    }

    pub fn timed_out(target: Option<SocketAddr>, sent_at: DateTime<Utc>, timeout: Duration) -> Self {
        Self::failure(
            ReplyStatus::TimedOut,
            target,
            sent_at,
            f64::INFINITY,
            format!("operation timed out after {:?}", timeout),
        )
    }

    pub fn cancelled(target: Option<SocketAddr>, sent_at: DateTime<Utc>) -> Self {
        Self::failure(ReplyStatus::Cancelled, target, sent_at, f64::INFINITY, "operation cancelled")
    }

    /// Rehydrate a stored reply. Returns `None` when the parts are inconsistent.
    pub fn from_parts(
        succeeded: bool,
        status: ReplyStatus,
        target: Option<SocketAddr>,
        sent_at: DateTime<Utc>,
        elapsed_ms: f64,
        error_message: Option<String>,
        detail: ReplyDetail,
    ) -> Option<Self> {
        if succeeded && status.is_failure() {
            return None;
        }
        Some(Self::build(succeeded, status, target, sent_at, elapsed_ms, error_message, detail))
    }

    fn build(
        succeeded: bool,
        status: ReplyStatus,
        target: Option<SocketAddr>,
        sent_at: DateTime<Utc>,
        elapsed_ms: f64,
        error_message: Option<String>,
        detail: ReplyDetail,
    ) -> Self {
        let elapsed_ms = if elapsed_ms.is_nan() || elapsed_ms < 0.0 {
            f64::INFINITY
        } else {
            round2(elapsed_ms)
        };
        Self {
            succeeded,
            status,
            target,
            sent_at,
            elapsed_ms,
            error_message: if succeeded { None } else { error_message },
            detail,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn failed(&self) -> bool {
        !self.succeeded
    }

    pub fn status(&self) -> ReplyStatus {
        self.status
    }

    pub fn status_code(&self) -> i32 {
        self.status.code()
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn detail(&self) -> &ReplyDetail {
        &self.detail
    }

    pub fn ttl(&self) -> Option<u8> {
        match self.detail {
            ReplyDetail::Icmp { ttl, .. } => ttl,
            ReplyDetail::Socket { ttl, .. } => Some(ttl),
            _ => None,
        }
    }

    pub fn buffer_len(&self) -> Option<usize> {
        match self.detail {
            ReplyDetail::Icmp { buffer_len, .. } => Some(buffer_len),
            ReplyDetail::Socket { bytes_sent, .. } => Some(bytes_sent),
            _ => None,
        }
    }

    /// Contacted endpoint as text; ICMP targets (port 0) print the address only.
    pub fn target_display(&self) -> String {
        match self.target {
            Some(addr) if addr.port() == 0 => addr.ip().to_string(),
            Some(addr) => addr.to_string(),
            None => String::new(),
        }
    }
}

fn duration_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1_000.0
}

fn serialize_elapsed<S: serde::Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        serializer.serialize_none()
    }
}
