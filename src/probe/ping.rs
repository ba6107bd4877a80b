//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native probes use blocking sockets inside spawn_blocking for precise
//! timing. A RAW socket supports TTL and payload customization and sees
//! ICMP error messages; an unprivileged DGRAM socket only sends a default
//! echo request. Requests with don't-fragment set go through the command,
//! which knows how to set the flag on every platform.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{resolve_target, IcmpStatus, ProbeError, ProbeTarget, Reply, ReplyDetail};
use crate::config::{DEFAULT_BUFFER_SIZE, DEFAULT_TTL};
use crate::endpoint::create_payload;

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;
const IPV6_HEADER_LEN: usize = 40;
const RECV_BUFFER_LEN: usize = 65_600;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// RAW sockets (root or CAP_NET_RAW)
    Raw,
    /// Unprivileged ping sockets; no TTL or payload control
    Dgram,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each ping request.
/// This ensures concurrent pings can be distinguished even to the same destination.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Raw;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged, default options only)");
        return IcmpCapability::Dgram;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// What goes on the wire for one native echo request.
#[derive(Debug, Clone)]
struct EchoRequest {
    raw: bool,
    /// `None` keeps the OS default.
    ttl: Option<u8>,
    payload: Arc<[u8]>,
}

impl EchoRequest {
    fn new(capability: IcmpCapability, target: &ProbeTarget) -> Self {
        match capability {
            IcmpCapability::Raw => Self {
                raw: true,
                ttl: (!target.uses_default_icmp_options()).then_some(target.ttl),
                payload: Arc::clone(&target.payload),
            },
            _ => Self {
                raw: false,
                ttl: None,
                payload: create_payload(DEFAULT_BUFFER_SIZE),
            },
        }
    }
}

/// A matched answer to our echo request.
#[derive(Debug, Clone, Copy, PartialEq)]
struct EchoAnswer {
    status: IcmpStatus,
    /// TTL of the answering packet, when the IP header was visible.
    ttl: Option<u8>,
}

/// Identifies our request among everything the socket receives.
#[derive(Debug, Clone, Copy)]
struct EchoMatcher {
    identifier: u16,
    sequence: u16,
    /// Linux ping sockets rewrite the identifier, so DGRAM matches on sequence only.
    check_identifier: bool,
}

impl EchoMatcher {
    fn matches(&self, icmp: &[u8]) -> bool {
        if icmp.len() < 8 {
            return false;
        }
        let id = u16::from_be_bytes([icmp[4], icmp[5]]);
        let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
        seq == self.sequence && (!self.check_identifier || id == self.identifier)
    }
}

/// Run an ICMP probe against the target.
pub(crate) async fn run_ping_probe(
    target: &ProbeTarget,
    timeout: Duration,
    sent_at: DateTime<Utc>,
) -> Result<Reply, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    // Resolve before spawn_blocking (DNS is async)
    let ip = resolve_target(target).await?.ip();

    let native = match capability {
        IcmpCapability::Raw => !target.dont_fragment,
        IcmpCapability::Dgram => true,
        IcmpCapability::CommandOnly => false,
    };

    if native {
        let request = EchoRequest::new(capability, target);
        let buffer_len = request.payload.len();
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, &request, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok((answer, elapsed)) => {
                return Ok(Reply::icmp(
                    answer.status,
                    Some(SocketAddr::new(ip, 0)),
                    sent_at,
                    elapsed,
                    ReplyDetail::Icmp { buffer_len, ttl: answer.ttl },
                ));
            }
            Err(ProbeError::Socket(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    ip,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }

    run_ping_command(ip, target, timeout, sent_at).await
}

/// Run blocking ICMP ping with precise timing.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, request: &EchoRequest, timeout: Duration) -> Result<(EchoAnswer, Duration), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let ty = if request.raw { Type::RAW } else { Type::DGRAM };
    let socket = Socket::new(domain, ty, Some(protocol))?;

    if let Some(ttl) = request.ttl {
        match ip {
            IpAddr::V4(_) => socket.set_ttl(u32::from(ttl))?,
            IpAddr::V6(_) => socket.set_unicast_hops_v6(u32::from(ttl))?,
        }
    }
    socket.set_write_timeout(Some(timeout))?;
    socket.connect(&SocketAddr::new(ip, 0).into())?;

    let (identifier, sequence) = generate_ping_id();
    let matcher = EchoMatcher { identifier, sequence, check_identifier: request.raw };
    let packet = match ip {
        IpAddr::V4(_) => build_echo_request(ECHO_REQUEST_V4, identifier, sequence, &request.payload),
        IpAddr::V6(_) => build_echo_request(ECHO_REQUEST_V6, identifier, sequence, &request.payload),
    };

    let mut buf = vec![MaybeUninit::<u8>::uninit(); RECV_BUFFER_LEN];

    // Start timing just before send
    let start = Instant::now();
    socket.send(&packet)?;

    // Receive replies until one answers OUR request or time runs out
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket.set_read_timeout(Some(remaining))?;

        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Socket(e),
        })?;
        // Stop timing immediately after receive
        let elapsed = start.elapsed();

        // SAFETY: recv initialized the first `len` bytes
        let received: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let answer = match ip {
            IpAddr::V4(_) => parse_icmpv4(received, &matcher),
            IpAddr::V6(_) => parse_icmpv6(received, &matcher),
        };
        if let Some(answer) = answer {
            return Ok((answer, elapsed));
        }
        // Someone else's packet, keep waiting
    }
}

/// Match an ICMPv4 packet, with or without its IP header, against our request.
fn parse_icmpv4(packet: &[u8], matcher: &EchoMatcher) -> Option<EchoAnswer> {
    let (icmp, ttl) = strip_ipv4_header(packet)?;
    if icmp.len() < 8 {
        return None;
    }
    let status = match icmp[0] {
        ECHO_REPLY_V4 => {
            return matcher.matches(icmp).then_some(EchoAnswer { status: IcmpStatus::Success, ttl });
        }
        3 => IcmpStatus::DestinationUnreachable,
        11 => IcmpStatus::TtlExpired,
        12 => IcmpStatus::ParameterProblem,
        _ => return None,
    };
    // Error messages quote the offending IP header plus 8 bytes of our request
    let (quoted, _) = strip_ipv4_header(&icmp[8..])?;
    (quoted.first() == Some(&ECHO_REQUEST_V4) && matcher.matches(quoted)).then_some(EchoAnswer { status, ttl })
}

/// Split off a leading IPv4 header if present, returning its TTL.
fn strip_ipv4_header(packet: &[u8]) -> Option<(&[u8], Option<u8>)> {
    match packet.first() {
        Some(first) if first >> 4 == 4 => {
            let ihl = usize::from(first & 0x0f) * 4;
            if ihl < 20 || packet.len() < ihl {
                return None;
            }
            Some((&packet[ihl..], Some(packet[8])))
        }
        Some(_) => Some((packet, None)),
        None => None,
    }
}

/// ICMPv6 sockets never include the IPv6 header.
fn parse_icmpv6(icmp: &[u8], matcher: &EchoMatcher) -> Option<EchoAnswer> {
    if icmp.len() < 8 {
        return None;
    }
    let status = match icmp[0] {
        ECHO_REPLY_V6 => {
            return matcher
                .matches(icmp)
                .then_some(EchoAnswer { status: IcmpStatus::Success, ttl: None });
        }
        1 => IcmpStatus::DestinationUnreachable,
        3 => IcmpStatus::TtlExpired,
        4 => IcmpStatus::ParameterProblem,
        _ => return None,
    };
    let quoted = icmp.get(8 + IPV6_HEADER_LEN..)?;
    (quoted.first() == Some(&ECHO_REQUEST_V6) && matcher.matches(quoted)).then_some(EchoAnswer { status, ttl: None })
}

/// Build an ICMP Echo Request packet carrying `payload`.
///
/// The checksum is filled in for ICMPv4; the kernel computes it for ICMPv6.
fn build_echo_request(kind: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.extend_from_slice(&[kind, 0, 0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);

    if kind == ECHO_REQUEST_V4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Run ping via command execution (fallback).
async fn run_ping_command(
    ip: IpAddr,
    target: &ProbeTarget,
    timeout: Duration,
    sent_at: DateTime<Utc>,
) -> Result<Reply, ProbeError> {
    let (program, args) = ping_command(ip, target, timeout);
    let start = Instant::now();
    let output = Command::new(program)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute {}: {}", program, e)))?;
    let elapsed = start.elapsed();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let contacted = Some(SocketAddr::new(ip, 0));
    let buffer_len = target.payload.len();

    if let Some(status) = parse_icmp_error(&stdout).or_else(|| parse_icmp_error(&stderr)) {
        return Ok(Reply::icmp(status, contacted, sent_at, elapsed, ReplyDetail::Icmp { buffer_len, ttl: None }));
    }

    if !output.status.success() {
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}{}", stdout, stderr)));
    }

    let ms = parse_ping_output(&stdout)?;
    Ok(Reply::icmp(
        IcmpStatus::Success,
        contacted,
        sent_at,
        Duration::from_secs_f64(ms / 1_000.0),
        ReplyDetail::Icmp { buffer_len, ttl: parse_reply_ttl(&stdout) },
    ))
}

/// Program and arguments for a single echo honouring the target's options.
fn ping_command(ip: IpAddr, target: &ProbeTarget, timeout: Duration) -> (&'static str, Vec<String>) {
    let macos = cfg!(target_os = "macos");
    let program = if macos && ip.is_ipv6() { "ping6" } else { "ping" };
    let mut args = vec!["-c".to_string(), "1".to_string()];

    if macos {
        if ip.is_ipv4() {
            // macOS takes the wait time in milliseconds
            args.extend(["-W".to_string(), timeout.as_millis().max(1).to_string()]);
        }
    } else {
        let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
        args.extend(["-W".to_string(), secs.to_string()]);
        if ip.is_ipv6() {
            args.push("-6".to_string());
        }
    }

    args.extend(["-s".to_string(), target.payload.len().to_string()]);

    if target.ttl != DEFAULT_TTL {
        let flag = if macos { "-m" } else { "-t" };
        if !(macos && ip.is_ipv6()) {
            args.extend([flag.to_string(), target.ttl.to_string()]);
        }
    }

    if target.dont_fragment && ip.is_ipv4() {
        if macos {
            args.push("-D".to_string());
        } else {
            args.extend(["-M".to_string(), "do".to_string()]);
        }
    }

    args.push(ip.to_string());
    (program, args)
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    // Pattern 1: Per-packet response "time=X.XXX ms" (Linux, some macOS)
    static RE1: OnceLock<Regex> = OnceLock::new();
    let re1 = RE1.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("static regex"));

    if let Some(ms) = re1
        .captures(output)
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms);
    }

    // Pattern 2: Summary line "round-trip min/avg/max/stddev = X/X/X/X ms" (macOS)
    // Pattern 3: Summary line "rtt min/avg/max/mdev = X/X/X/X ms" (Linux)
    static RE2: OnceLock<Regex> = OnceLock::new();
    let re2 = RE2.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .expect("static regex")
    });

    // Use the average (second capture group)
    if let Some(ms) = re2
        .captures(output)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms);
    }

    Err(ProbeError::Command(format!("failed to parse ping output: {}", output)))
}

fn parse_reply_ttl(output: &str) -> Option<u8> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)(?:ttl|hlim)=(\d+)").expect("static regex"));
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Recognize ICMP error reports in ping output.
fn parse_icmp_error(output: &str) -> Option<IcmpStatus> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?P<ttl>time to live exceeded|time exceeded)|(?P<unreach>destination \w+ unreachable|frag needed|message too long)|(?P<param>parameter problem)",
        )
        .expect("static regex")
    });
    let caps = re.captures(output)?;
    if caps.name("ttl").is_some() {
        Some(IcmpStatus::TtlExpired)
    } else if caps.name("unreach").is_some() {
        Some(IcmpStatus::DestinationUnreachable)
    } else {
        Some(IcmpStatus::ParameterProblem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeDefaults;
    use crate::endpoint::parse_line;

    fn target(line: &str) -> ProbeTarget {
        ProbeTarget::from(&parse_line(line, &ProbeDefaults::default()).unwrap())
    }

    fn ipv4_header(ttl: u8) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[8] = ttl;
        header[9] = 1;
        header
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_echo_request(ECHO_REQUEST_V4, 0x1234, 0x0001, b"abc");
        // A packet carrying its own checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let payload = create_payload(32);
        let packet = build_echo_request(ECHO_REQUEST_V4, 0x1234, 0x0001, &payload);
        assert_eq!(packet.len(), 40);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
        assert_eq!(&packet[8..], &payload[..]);

        let v6 = build_echo_request(ECHO_REQUEST_V6, 1, 2, &[]);
        assert_eq!(v6, vec![128, 0, 0, 0, 0, 1, 0, 2]);
    }

    #[test]
    fn test_parse_echo_reply_with_ip_header() {
        let matcher = EchoMatcher { identifier: 0x1234, sequence: 7, check_identifier: true };
        let mut packet = ipv4_header(57);
        packet.extend_from_slice(&[ECHO_REPLY_V4, 0, 0, 0, 0x12, 0x34, 0, 7]);
        let answer = parse_icmpv4(&packet, &matcher).unwrap();
        assert_eq!(answer.status, IcmpStatus::Success);
        assert_eq!(answer.ttl, Some(57));

        let other = EchoMatcher { identifier: 0x9999, sequence: 7, check_identifier: true };
        assert!(parse_icmpv4(&packet, &other).is_none());
    }

    #[test]
    fn test_dgram_reply_ignores_identifier() {
        let matcher = EchoMatcher { identifier: 0x1234, sequence: 3, check_identifier: false };
        let packet = [ECHO_REPLY_V4, 0, 0, 0, 0xab, 0xcd, 0, 3];
        let answer = parse_icmpv4(&packet, &matcher).unwrap();
        assert_eq!(answer.status, IcmpStatus::Success);
        assert_eq!(answer.ttl, None);
    }

    #[test]
    fn test_parse_time_exceeded() {
        let matcher = EchoMatcher { identifier: 0x1234, sequence: 9, check_identifier: true };
        let mut packet = ipv4_header(250);
        packet.extend_from_slice(&[11, 0, 0, 0, 0, 0, 0, 0]);
        packet.extend_from_slice(&ipv4_header(1));
        packet.extend_from_slice(&[ECHO_REQUEST_V4, 0, 0, 0, 0x12, 0x34, 0, 9]);
        let answer = parse_icmpv4(&packet, &matcher).unwrap();
        assert_eq!(answer.status, IcmpStatus::TtlExpired);
    }

    #[test]
    fn test_parse_icmpv6_unreachable() {
        let matcher = EchoMatcher { identifier: 5, sequence: 6, check_identifier: true };
        let mut packet = vec![1, 0, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0u8; IPV6_HEADER_LEN]);
        packet.extend_from_slice(&[ECHO_REQUEST_V6, 0, 0, 0, 0, 5, 0, 6]);
        let answer = parse_icmpv6(&packet, &matcher).unwrap();
        assert_eq!(answer.status, IcmpStatus::DestinationUnreachable);
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12.345).abs() < 1e-9);
        assert_eq!(parse_reply_ttl(output), Some(117));
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 17.906).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(parse_ping_output("nothing here"), Err(ProbeError::Command(_))));
    }

    #[test]
    fn test_parse_icmp_error_output() {
        let ttl = "From 10.0.0.1 icmp_seq=1 Time to live exceeded";
        assert_eq!(parse_icmp_error(ttl), Some(IcmpStatus::TtlExpired));
        let unreach = "From 192.168.1.1 icmp_seq=1 Destination Host Unreachable";
        assert_eq!(parse_icmp_error(unreach), Some(IcmpStatus::DestinationUnreachable));
        let frag = "ping: local error: message too long, mtu=1500";
        assert_eq!(parse_icmp_error(frag), Some(IcmpStatus::DestinationUnreachable));
        assert_eq!(parse_icmp_error("64 bytes from 1.1.1.1: time=1 ms"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_command_args_honour_options() {
        let mut t = target("icmp://10.0.0.1|1|2|100");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (program, args) = ping_command(ip, &t, Duration::from_millis(1500));
        assert_eq!(program, "ping");
        assert_eq!(args, ["-c", "1", "-W", "2", "-s", "100", "10.0.0.1"]);

        t.ttl = 5;
        t.dont_fragment = true;
        let (_, args) = ping_command(ip, &t, Duration::from_secs(1));
        assert_eq!(args, ["-c", "1", "-W", "1", "-s", "100", "-t", "5", "-M", "do", "10.0.0.1"]);
    }

    #[test]
    fn test_dgram_request_uses_defaults() {
        let mut t = target("icmp://10.0.0.1|1|1|500");
        t.ttl = 9;
        let request = EchoRequest::new(IcmpCapability::Dgram, &t);
        assert!(!request.raw);
        assert_eq!(request.ttl, None);
        assert_eq!(request.payload.len(), DEFAULT_BUFFER_SIZE);

        let request = EchoRequest::new(IcmpCapability::Raw, &t);
        assert_eq!(request.ttl, Some(9));
        assert_eq!(request.payload.len(), 500);
    }
}
