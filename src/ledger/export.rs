//! CSV and JSON export of reply history.

use std::io::{self, Write};

use chrono::SecondsFormat;

use super::Ledger;
use crate::probe::Reply;

pub const CSV_HEADER: &str = "IsSucceeded;Status;StatusCode;IpEndPoint;SentDateTime;Time;Ttl;BufferLength";

/// Write the ledger as semicolon-delimited rows, most recent first.
pub fn write_csv<W: Write>(ledger: &Ledger, mut out: W) -> io::Result<()> {
    writeln!(out, "{}", CSV_HEADER)?;
    for reply in ledger.iter() {
        writeln!(out, "{}", csv_row(reply))?;
    }
    Ok(())
}

pub fn to_csv(ledger: &Ledger) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_csv(ledger, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn csv_row(reply: &Reply) -> String {
    let time = if reply.elapsed_ms().is_finite() {
        reply.elapsed_ms().to_string()
    } else {
        String::new()
    };
    [
        reply.succeeded().to_string(),
        reply.status().to_string(),
        reply.status_code().to_string(),
        reply.target_display(),
        reply.sent_at().to_rfc3339_opts(SecondsFormat::Millis, true),
        time,
        reply.ttl().map(|t| t.to_string()).unwrap_or_default(),
        reply.buffer_len().map(|b| b.to_string()).unwrap_or_default(),
    ]
    .into_iter()
    .map(|field| escape(&field))
    .collect::<Vec<_>>()
    .join(";")
}

fn escape(field: &str) -> String {
    if field.contains([';', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Replies as a JSON array, most recent first.
pub fn to_json(ledger: &Ledger) -> serde_json::Result<String> {
    let replies: Vec<&Reply> = ledger.iter().collect();
    serde_json::to_string_pretty(&replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{IcmpStatus, ReplyDetail};
    use chrono::{TimeZone, Utc};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    #[test]
    fn test_csv_header_and_rows() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 0);
        let mut ledger = Ledger::new();
        ledger.append(Reply::icmp(
            IcmpStatus::Success,
            Some(target),
            at,
            Duration::from_micros(12_500),
            ReplyDetail::Icmp { buffer_len: 32, ttl: Some(64) },
        ));
        ledger.append(Reply::timed_out(Some(target), at, Duration::from_secs(1)));

        let csv = to_csv(&ledger);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "false;TimedOut;-2;10.0.0.1;2024-05-01T12:00:00.000Z;;;");
        assert_eq!(lines[2], "true;Success;0;10.0.0.1;2024-05-01T12:00:00.000Z;12.5;64;32");
    }

    #[test]
    fn test_empty_ledger_has_header_only() {
        let csv = to_csv(&Ledger::new());
        assert_eq!(csv, format!("{}\n", CSV_HEADER));
    }

    #[test]
    fn test_json_export_nulls_infinite_elapsed() {
        let mut ledger = Ledger::new();
        ledger.append(Reply::cancelled(None, Utc::now()));
        let json = to_json(&ledger).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value[0]["elapsed_ms"].is_null());
        assert_eq!(value[0]["succeeded"], false);
    }
}
