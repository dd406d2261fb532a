//! UDP probe: DNS query or opaque datagram echo.
//!
//! No connection to time, so silence within the timeout is reported as
//! `timed_out` metrics rather than an error.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{cancellable, dns, resolve, split_host_port, ProbeError};
use crate::model::{ProbeTarget, UdpMetrics, UdpOptions, UdpVariant};
use crate::stats::Timer;

const MAX_DATAGRAM: usize = 4096;

pub async fn run_udp(
    target: &ProbeTarget,
    opts: &UdpOptions,
    cancel: &CancellationToken,
) -> Result<UdpMetrics, ProbeError> {
    let default_port = match opts.variant {
        UdpVariant::Dns => Some(dns::DNS_PORT),
        UdpVariant::Raw => None,
    };
    let (host, port) = split_host_port(&target.address, default_port)?;
    cancellable(cancel, measure(&host, port, opts, target.timeout)).await
}

async fn measure(host: &str, port: u16, opts: &UdpOptions, timeout: Duration) -> Result<UdpMetrics, ProbeError> {
    let deadline = Instant::now() + timeout;
    let addrs = resolve(host, port, deadline, timeout).await?;
    let addr = addrs[0];

    let socket = bind_for(addr).await?;
    // connected sockets only accept datagrams from the peer and surface ICMP errors
    socket
        .connect(addr)
        .await
        .map_err(|e| ProbeError::Connection(format!("{}: {}", addr, e)))?;

    let tx_id: u16 = rand::random();
    let payload = match opts.variant {
        UdpVariant::Dns => dns::build_query(&opts.query, tx_id)?,
        UdpVariant::Raw => opts.payload.as_bytes().to_vec(),
    };

    let mut metrics = UdpMetrics {
        round_trip_ms: None,
        response_payload_size: 0,
        timed_out: false,
        dns_rcode: None,
        remote_addr: addr.to_string(),
    };

    let timer = Timer::start();
    socket.send(&payload).await.map_err(io_error)?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let received = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
        Ok(result) => result.map_err(io_error)?,
        Err(_) => {
            metrics.timed_out = true;
            return Ok(metrics);
        }
    };
    metrics.round_trip_ms = Some(timer.elapsed_ms());
    metrics.response_payload_size = received;

    if opts.variant == UdpVariant::Dns {
        let response = dns::parse_response(&buf[..received], tx_id)?;
        if response.rcode != 0 {
            tracing::debug!(host, rcode = response.rcode, "DNS server answered with an error code");
        }
        metrics.dns_rcode = Some(response.rcode);
    }

    Ok(metrics)
}

async fn bind_for(peer: SocketAddr) -> Result<UdpSocket, ProbeError> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(local)
        .await
        .map_err(|e| ProbeError::Internal(format!("failed to bind UDP socket: {}", e)))
}

fn io_error(e: std::io::Error) -> ProbeError {
    match e.kind() {
        // ICMP port unreachable on a connected socket
        std::io::ErrorKind::ConnectionRefused => ProbeError::Connection("port unreachable".to_string()),
        std::io::ErrorKind::PermissionDenied => ProbeError::Permission(e.to_string()),
        _ => ProbeError::Connection(e.to_string()),
    }
}
