//! HTTP probe implementation.

use std::time::Instant;

use chrono::{DateTime, Utc};

use super::{HttpErrorKind, ProbeError, ProbeTarget, Reply};
use crate::config::HttpSuccessPolicy;

/// GET the target URL and read the full body.
///
/// Any response is a terminal reply; `policy` decides whether its status
/// counts as a success.
pub(crate) async fn run_http_probe(
    client: &reqwest::Client,
    policy: HttpSuccessPolicy,
    target: &ProbeTarget,
    sent_at: DateTime<Utc>,
) -> Result<Reply, ProbeError> {
    let start = Instant::now();

    let response = client
        .get(&target.address_or_url)
        .send()
        .await
        .map_err(classify)?;
    let status = response.status().as_u16();
    let remote = response.remote_addr();

    // Read the full body to measure complete transfer time
    let body = response.bytes().await.map_err(classify)?;
    let elapsed = start.elapsed();

    Ok(Reply::http(
        status,
        policy.accepts(status),
        remote.or_else(|| target.socket_hint()),
        sent_at,
        elapsed,
        body.len() as u64,
    ))
}

fn classify(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        // The prober's own deadline supplies the duration.
        return ProbeError::Timeout(std::time::Duration::ZERO);
    }
    let kind = if e.is_builder() {
        HttpErrorKind::Builder
    } else if e.is_connect() {
        HttpErrorKind::Connect
    } else if e.is_redirect() {
        HttpErrorKind::Redirect
    } else if e.is_body() {
        HttpErrorKind::Body
    } else if e.is_decode() {
        HttpErrorKind::Decode
    } else if e.is_request() {
        HttpErrorKind::Request
    } else {
        HttpErrorKind::Other
    };
    ProbeError::Http { kind, message: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeDefaults;
    use crate::endpoint::parse_line;
    use crate::probe::ReplyStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP/1.1 response per connection.
    async fn serve(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        port
    }

    fn target(port: u16) -> ProbeTarget {
        ProbeTarget::from(&parse_line(&format!("http://127.0.0.1:{}/health", port), &ProbeDefaults::default()).unwrap())
    }

    fn client(policy: HttpSuccessPolicy) -> reqwest::Client {
        let redirect = if policy.follows_redirects() {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };
        reqwest::Client::builder().redirect(redirect).build().unwrap()
    }

    #[tokio::test]
    async fn test_http_probe_success() {
        let port = serve("200 OK", "hello").await;
        let policy = HttpSuccessPolicy::Success;
        let reply = run_http_probe(&client(policy), policy, &target(port), Utc::now()).await.unwrap();
        assert!(reply.succeeded());
        assert_eq!(reply.status(), ReplyStatus::Http(200));
        assert_eq!(reply.detail(), &crate::probe::ReplyDetail::Http { response_size: 5 });
    }

    #[tokio::test]
    async fn test_http_probe_server_error_is_failure() {
        let port = serve("503 Service Unavailable", "").await;
        let policy = HttpSuccessPolicy::Success;
        let reply = run_http_probe(&client(policy), policy, &target(port), Utc::now()).await.unwrap();
        assert!(reply.failed());
        assert_eq!(reply.status_code(), 503);
    }

    #[tokio::test]
    async fn test_http_probe_redirect_policy() {
        let port = serve("302 Found", "").await;
        let policy = HttpSuccessPolicy::SuccessOrRedirect;
        let reply = run_http_probe(&client(policy), policy, &target(port), Utc::now()).await.unwrap();
        assert!(reply.succeeded());
        assert_eq!(reply.status(), ReplyStatus::Http(302));
    }

    #[tokio::test]
    async fn test_http_probe_connect_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = HttpSuccessPolicy::Success;
        let err = run_http_probe(&client(policy), policy, &target(port), Utc::now()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Http { kind: HttpErrorKind::Connect, .. }));
    }
}
