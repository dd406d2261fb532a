//! HTTP probe implementation.
//!
//! The connection is built step by step (DNS, TCP connect, TLS) so each
//! phase can be timed, then a single request is sent over a hyper client
//! connection. Phases are contiguous checkpoints on one monotonic timer, so
//! they sum to the total.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::{http1, http2};
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{cancellable, resolve, tls, within, ProbeError};
use crate::model::{HttpMetrics, HttpOptions, HttpVersion, ProbeTarget, TimeoutPhase};
use crate::stats::{duration_ms, Timer};

/// Parsed request line and connection parameters.
#[derive(Debug, Clone)]
pub(crate) struct RequestPlan {
    uri: Uri,
    method: Method,
    host: String,
    port: u16,
    https: bool,
}

impl RequestPlan {
    fn authority(&self) -> String {
        let default_port = if self.https { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    fn path_and_query(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }
}

/// Check that the target is a well-formed http(s) URL.
pub(crate) fn validate(address: &str, opts: &HttpOptions) -> Result<RequestPlan, ProbeError> {
    let uri: Uri = address
        .parse()
        .map_err(|e| ProbeError::Config(format!("invalid URL {}: {}", address, e)))?;

    let https = match uri.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        Some(other) => {
            return Err(ProbeError::Config(format!("unsupported URL scheme: {}", other)))
        }
        None => return Err(ProbeError::Config(format!("URL {} has no scheme", address))),
    };

    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProbeError::Config(format!("URL {} has no host", address)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    let method = Method::from_bytes(opts.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ProbeError::Config(format!("invalid HTTP method: {}", opts.method)))?;

    Ok(RequestPlan {
        uri,
        method,
        host,
        port,
        https,
    })
}

/// Run an HTTP probe against the target URL.
///
/// Non-2xx/3xx statuses are reported, not treated as failures.
pub async fn run_http(
    target: &ProbeTarget,
    opts: &HttpOptions,
    cancel: &CancellationToken,
) -> Result<HttpMetrics, ProbeError> {
    let plan = validate(&target.address, opts)?;
    cancellable(cancel, measure(&plan, opts, target.timeout)).await
}

/// Timestamps of an exchange, relative to the probe timer.
struct Exchange {
    status: u16,
    version: String,
    bytes: u64,
    first_byte: Duration,
    done: Duration,
}

async fn measure(plan: &RequestPlan, opts: &HttpOptions, timeout: Duration) -> Result<HttpMetrics, ProbeError> {
    let deadline = Instant::now() + timeout;
    let timer = Timer::start();

    let addrs = resolve(&plan.host, plan.port, deadline, timeout).await?;
    let dns_done = timer.elapsed();

    let stream = within(deadline, TimeoutPhase::Connect, timeout, connect_any(&addrs)).await??;
    let remote_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let _ = stream.set_nodelay(true);
    let connect_done = timer.elapsed();

    let (exchange, tls_done) = if plan.https {
        let alpn: &[&[u8]] = match opts.version {
            HttpVersion::Auto => &[tls::ALPN_H2, tls::ALPN_HTTP11],
            HttpVersion::Http1 => &[tls::ALPN_HTTP11],
            HttpVersion::Http2 => &[tls::ALPN_H2],
        };
        let connector = tls::connector(opts.verify_tls, alpn)?;
        let server_name = tls::server_name(&plan.host)?;

        let tls_stream = within(
            deadline,
            TimeoutPhase::Handshake,
            timeout,
            connector.connect(server_name, stream),
        )
        .await?
        .map_err(|e| ProbeError::Tls(e.to_string()))?;
        let tls_done = timer.elapsed();

        let use_h2 = tls::negotiated_h2(tls_stream.get_ref().1);
        if opts.version == HttpVersion::Http2 && !use_h2 {
            return Err(ProbeError::ProtocolMismatch(
                "server did not negotiate HTTP/2 via ALPN".to_string(),
            ));
        }
        let exchange = exchange(tls_stream, use_h2, plan, opts, deadline, timeout, &timer).await?;
        (exchange, tls_done)
    } else {
        // HTTP/2 over plaintext uses prior knowledge
        let use_h2 = opts.version == HttpVersion::Http2;
        let exchange = exchange(stream, use_h2, plan, opts, deadline, timeout, &timer).await?;
        (exchange, connect_done)
    };

    let dns_ms = duration_ms(dns_done);
    let connect_ms = duration_ms(connect_done - dns_done);
    let tls_ms = duration_ms(tls_done - connect_done);
    let ttfb_ms = duration_ms(exchange.first_byte - tls_done);
    let transfer_ms = duration_ms(exchange.done - exchange.first_byte);
    let total_ms = duration_ms(exchange.done);

    let throughput_mbps = (exchange.bytes > 0 && total_ms > 0.0)
        .then(|| (exchange.bytes as f64 * 8.0 / 1_000_000.0) / (total_ms / 1000.0));

    tracing::debug!(
        host = %plan.host,
        status = exchange.status,
        total_ms,
        "HTTP probe completed"
    );

    Ok(HttpMetrics {
        dns_ms,
        connect_ms,
        tls_ms,
        ttfb_ms,
        transfer_ms,
        total_ms,
        status_code: exchange.status,
        bytes_transferred: exchange.bytes,
        throughput_mbps,
        http_version: exchange.version,
        remote_addr,
    })
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, ProbeError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(format!("{}: {}", addr, e)),
        }
    }
    Err(ProbeError::Connection(
        last_err.unwrap_or_else(|| "no addresses to connect to".to_string()),
    ))
}

async fn exchange<S>(
    io: S,
    use_h2: bool,
    plan: &RequestPlan,
    opts: &HttpOptions,
    deadline: Instant,
    timeout: Duration,
    timer: &Timer,
) -> Result<Exchange, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);

    // HTTP/2 needs the absolute form for :scheme and :authority
    let uri = if use_h2 {
        plan.uri.to_string()
    } else {
        plan.path_and_query()
    };

    let request = Request::builder()
        .method(plan.method.clone())
        .uri(uri)
        .header(HOST, plan.authority())
        .header(USER_AGENT, opts.user_agent.as_str())
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProbeError::Config(format!("invalid request: {}", e)))?;

    let phase = TimeoutPhase::Read;

    if use_h2 {
        let (mut sender, conn) = within(deadline, phase, timeout, http2::handshake(TokioExecutor::new(), io))
            .await?
            .map_err(hyper_error)?;
        let response = async {
            let response = sender.send_request(request).await.map_err(hyper_error)?;
            drain(response, timer).await
        };
        within(deadline, phase, timeout, drive(conn, response)).await?
    } else {
        let (mut sender, conn) = within(deadline, phase, timeout, http1::handshake(io))
            .await?
            .map_err(hyper_error)?;
        let response = async {
            let response = sender.send_request(request).await.map_err(hyper_error)?;
            drain(response, timer).await
        };
        within(deadline, phase, timeout, drive(conn, response)).await?
    }
}

/// Poll the connection alongside the request until the response is drained.
async fn drive<C, F>(conn: C, response: F) -> Result<Exchange, ProbeError>
where
    C: std::future::Future<Output = Result<(), hyper::Error>>,
    F: std::future::Future<Output = Result<Exchange, ProbeError>>,
{
    tokio::pin!(conn);
    tokio::pin!(response);

    tokio::select! {
        result = &mut response => result,
        closed = &mut conn => {
            closed.map_err(hyper_error)?;
            // connection closed cleanly; buffered body frames are still readable
            response.await
        }
    }
}

async fn drain(response: Response<hyper::body::Incoming>, timer: &Timer) -> Result<Exchange, ProbeError> {
    let first_byte = timer.elapsed();
    let status = response.status().as_u16();
    let version = format!("{:?}", response.version());

    let mut body = response.into_body();
    let mut bytes = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(hyper_error)?;
        if let Some(chunk) = frame.data_ref() {
            bytes += chunk.len() as u64;
        }
    }

    Ok(Exchange {
        status,
        version,
        bytes,
        first_byte,
        done: timer.elapsed(),
    })
}

fn hyper_error(e: hyper::Error) -> ProbeError {
    if e.is_parse() || e.is_parse_status() {
        ProbeError::ProtocolMismatch(format!("malformed HTTP response: {}", e))
    } else {
        ProbeError::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeSpec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP/1.1 response after reading the request head.
    async fn serve_once(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        addr
    }

    fn target(url: String, timeout: Duration) -> ProbeTarget {
        ProbeTarget::new("http", url, timeout, ProbeSpec::Http(HttpOptions::default()))
    }

    #[tokio::test]
    async fn test_http_probe_phases_sum_to_total() {
        let addr = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello").await;
        let t = target(format!("http://{}/health", addr), Duration::from_secs(5));

        let metrics = run_http(&t, &HttpOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(metrics.status_code, 200);
        assert_eq!(metrics.bytes_transferred, 5);
        assert_eq!(metrics.tls_ms, 0.0);
        assert!(metrics.throughput_mbps.is_some());
        assert!((metrics.phase_sum_ms() - metrics.total_ms).abs() < 0.01);
        assert_eq!(metrics.http_version, "HTTP/1.1");
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_failure() {
        let addr = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let t = target(format!("http://{}/", addr), Duration::from_secs(5));

        let metrics = run_http(&t, &HttpOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(metrics.status_code, 404);
        assert_eq!(metrics.bytes_transferred, 0);
        assert!(metrics.throughput_mbps.is_none());
    }

    #[tokio::test]
    async fn test_garbage_response_is_protocol_mismatch() {
        let addr = serve_once(b"SSH-2.0-OpenSSH_9.6\r\n\r\n").await;
        let t = target(format!("http://{}/", addr), Duration::from_secs(5));

        let err = run_http(&t, &HttpOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ProtocolMismatch(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let t = target(format!("http://{}/", addr), Duration::from_secs(2));
        let err = run_http(&t, &HttpOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Connection(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_stalled_server_times_out_in_read_phase() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let t = target(format!("http://{}/", addr), Duration::from_millis(200));
        let err = run_http(&t, &HttpOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Some(TimeoutPhase::Read));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let t = target(format!("http://{}/", addr), Duration::from_secs(10));
        let err = run_http(&t, &HttpOptions::default(), &cancel).await.unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled));
    }

    #[test]
    fn test_validate_url() {
        let opts = HttpOptions::default();
        assert!(validate("https://example.test", &opts).is_ok());
        assert!(validate("ftp://example.test", &opts).is_err());
        assert!(validate("example.test", &opts).is_err());
        let plan = validate("http://example.test:8080/a?b=1", &opts).unwrap();
        assert_eq!(plan.port, 8080);
        assert_eq!(plan.authority(), "example.test:8080");
        assert_eq!(plan.path_and_query(), "/a?b=1");

        let bad_method = HttpOptions {
            method: "GE T".to_string(),
            ..HttpOptions::default()
        };
        assert!(validate("http://example.test", &bad_method).is_err());
    }
}
