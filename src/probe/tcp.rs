//! TCP probe: bare connect, TLS handshake, or SSH banner check.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{cancellable, resolve, split_host_port, tls, within, ProbeError};
use crate::model::{ProbeTarget, TcpMetrics, TcpOptions, TcpVariant, TimeoutPhase};
use crate::stats::duration_ms;

/// Identification strings are capped at 255 bytes including CR LF.
const MAX_BANNER_LEN: u64 = 255;

/// Run a TCP probe against `host:port`.
///
/// Connect and handshake each get the full timeout, so a stalled handshake
/// is reported as a handshake timeout.
pub async fn run_tcp(
    target: &ProbeTarget,
    opts: &TcpOptions,
    cancel: &CancellationToken,
) -> Result<TcpMetrics, ProbeError> {
    let (host, port) = split_host_port(&target.address, None)?;
    cancellable(cancel, measure(&host, port, opts, target.timeout)).await
}

async fn measure(host: &str, port: u16, opts: &TcpOptions, timeout: Duration) -> Result<TcpMetrics, ProbeError> {
    let start = Instant::now();
    let addrs = resolve(host, port, start + timeout, timeout).await?;
    let resolved = Instant::now();

    let stream = connect(&addrs, resolved + timeout, timeout).await?;
    let connected = Instant::now();
    let remote_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let mut metrics = TcpMetrics {
        resolve_ms: duration_ms(resolved - start),
        connect_ms: duration_ms(connected - resolved),
        handshake_ms: 0.0,
        tls_version: None,
        cipher_suite: None,
        server_banner: None,
        remote_addr,
    };

    let handshake_deadline = connected + timeout;
    match opts.variant {
        TcpVariant::Raw => {}
        TcpVariant::Tls => {
            let connector = tls::connector(opts.verify_tls, &[])?;
            let server_name = tls::server_name(host)?;
            let tls_stream = within(
                handshake_deadline,
                TimeoutPhase::Handshake,
                timeout,
                connector.connect(server_name, stream),
            )
            .await?
            .map_err(|e| ProbeError::Tls(e.to_string()))?;

            let (_, conn) = tls_stream.get_ref();
            metrics.tls_version = tls::version_name(conn);
            metrics.cipher_suite = tls::cipher_name(conn);
            metrics.handshake_ms = duration_ms(connected.elapsed());
        }
        TcpVariant::Ssh => {
            let banner = within(
                handshake_deadline,
                TimeoutPhase::Handshake,
                timeout,
                read_banner(stream),
            )
            .await??;
            metrics.handshake_ms = duration_ms(connected.elapsed());
            metrics.server_banner = Some(banner);
        }
    }

    tracing::debug!(host, port, connect_ms = metrics.connect_ms, "TCP probe completed");
    Ok(metrics)
}

async fn connect(addrs: &[SocketAddr], deadline: Instant, timeout: Duration) -> Result<TcpStream, ProbeError> {
    let mut last_err = None;
    for addr in addrs {
        match within(deadline, TimeoutPhase::Connect, timeout, TcpStream::connect(addr)).await? {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(format!("{}: {}", addr, e)),
        }
    }
    Err(ProbeError::Connection(
        last_err.unwrap_or_else(|| "no addresses to connect to".to_string()),
    ))
}

/// Read the server identification line and check the `SSH-` prefix.
async fn read_banner(stream: TcpStream) -> Result<String, ProbeError> {
    let mut reader = BufReader::new(stream.take(MAX_BANNER_LEN));
    let mut line = String::new();

    let n = match reader.read_line(&mut line).await {
        Ok(n) => n,
        // a non-UTF-8 first line cannot be an identification string
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(ProbeError::ProtocolMismatch("banner is not valid text".to_string()))
        }
        Err(e) => return Err(ProbeError::Connection(format!("banner read failed: {}", e))),
    };

    if n == 0 {
        return Err(ProbeError::ProtocolMismatch(
            "connection closed before a banner was sent".to_string(),
        ));
    }

    let banner = line.trim_end_matches(['\r', '\n']).to_string();
    if !banner.starts_with("SSH-") {
        return Err(ProbeError::ProtocolMismatch(format!(
            "unexpected banner: {:?}",
            truncate(&banner, 64)
        )));
    }
    Ok(banner)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
