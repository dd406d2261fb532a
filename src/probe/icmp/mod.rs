//! ICMP probe: ping bursts and traceroute over native ICMP sockets.
//!
//! Socket access goes through an [`IcmpCapability`], detected once per
//! process. Without privileges the probe reports a permission error; it never
//! falls back to another protocol.

mod packet;
mod ping;
mod socket;
mod traceroute;

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::socket::{permission_error, IcmpSocket, SocketKind};
use super::{cancellable, resolve, ProbeError};
use crate::model::{IcmpMetrics, IcmpOptions, IcmpVariant, ProbeTarget};

/// Largest echo payload that fits a 1500 byte MTU over IPv4.
const MAX_PAYLOAD: usize = 1472;
const MAX_COUNT: u32 = 1000;

/// Access to ICMP sockets on this host.
pub trait IcmpCapability: fmt::Debug + Send + Sync {
    /// Open a socket suitable for `variant` towards `ip`.
    fn open(&self, ip: IpAddr, variant: IcmpVariant) -> Result<IcmpSocket, ProbeError>;
}

/// Raw sockets when privileged, unprivileged datagram sockets for ping otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeIcmp;

impl IcmpCapability for NativeIcmp {
    fn open(&self, ip: IpAddr, variant: IcmpVariant) -> Result<IcmpSocket, ProbeError> {
        let raw_err = match IcmpSocket::open(ip, SocketKind::Raw) {
            Ok(socket) => return Ok(socket),
            Err(e) => e,
        };

        match variant {
            // time-exceeded messages are only delivered to raw sockets
            IcmpVariant::Traceroute => Err(socket_error(raw_err, "traceroute requires a raw ICMP socket")),
            IcmpVariant::Ping => IcmpSocket::open(ip, SocketKind::Dgram)
                .map_err(|e| socket_error(e, "no usable ICMP socket")),
        }
    }
}

/// No ICMP socket can be opened; every probe is a permission error.
#[derive(Debug, Clone)]
pub struct Unavailable {
    pub reason: String,
}

impl IcmpCapability for Unavailable {
    fn open(&self, _ip: IpAddr, _variant: IcmpVariant) -> Result<IcmpSocket, ProbeError> {
        Err(ProbeError::Permission(format!(
            "ICMP sockets unavailable: {} (grant CAP_NET_RAW or run as root)",
            self.reason
        )))
    }
}

static ICMP_CAPABILITY: OnceLock<Arc<dyn IcmpCapability>> = OnceLock::new();

/// The capability detected for this process.
pub fn icmp_capability() -> Arc<dyn IcmpCapability> {
    ICMP_CAPABILITY.get_or_init(detect_icmp_capability).clone()
}

fn detect_icmp_capability() -> Arc<dyn IcmpCapability> {
    let probe_ip = IpAddr::from([127, 0, 0, 1]);

    if IcmpSocket::open(probe_ip, SocketKind::Raw).is_ok() {
        tracing::info!("ICMP probe: using native ICMP (RAW socket, privileged)");
        return Arc::new(NativeIcmp);
    }

    match IcmpSocket::open(probe_ip, SocketKind::Dgram) {
        Ok(_) => {
            tracing::info!("ICMP probe: using native ICMP (DGRAM socket, unprivileged); traceroute unavailable");
            Arc::new(NativeIcmp)
        }
        Err(e) => {
            tracing::warn!("ICMP probe: no ICMP socket available: {}", e);
            Arc::new(Unavailable { reason: e.to_string() })
        }
    }
}

fn socket_error(e: io::Error, context: &str) -> ProbeError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => match permission_error(e) {
            ProbeError::Permission(msg) => ProbeError::Permission(format!("{}: {}", context, msg)),
            other => other,
        },
        _ => ProbeError::Internal(format!("{}: {}", context, e)),
    }
}

/// Check an ICMP target: a bare host and sane burst parameters.
pub(crate) fn validate(address: &str, opts: &IcmpOptions) -> Result<(), ProbeError> {
    let host = address.trim();
    if host.is_empty() || host.contains('/') || host.contains(char::is_whitespace) {
        return Err(ProbeError::Config(format!("ICMP target must be a bare host: {:?}", address)));
    }
    // a port makes no sense for ICMP; bare IPv6 literals contain colons
    if host.contains(':') && host.parse::<IpAddr>().is_err() {
        return Err(ProbeError::Config(format!("ICMP target must not carry a port: {}", address)));
    }
    if opts.count == 0 || opts.count > MAX_COUNT {
        return Err(ProbeError::Config(format!("count must be between 1 and {}", MAX_COUNT)));
    }
    if opts.max_hops == 0 {
        return Err(ProbeError::Config("max_hops must be at least 1".to_string()));
    }
    if opts.attempts_per_hop == 0 {
        return Err(ProbeError::Config("attempts_per_hop must be at least 1".to_string()));
    }
    if opts.payload_size > MAX_PAYLOAD {
        return Err(ProbeError::Config(format!("payload_size must not exceed {}", MAX_PAYLOAD)));
    }
    Ok(())
}

/// Run an ICMP probe with the process capability.
pub async fn run_icmp(
    target: &ProbeTarget,
    opts: &IcmpOptions,
    cancel: &CancellationToken,
) -> Result<IcmpMetrics, ProbeError> {
    run_with(icmp_capability(), target, opts, cancel).await
}

pub(crate) async fn run_with(
    capability: Arc<dyn IcmpCapability>,
    target: &ProbeTarget,
    opts: &IcmpOptions,
    cancel: &CancellationToken,
) -> Result<IcmpMetrics, ProbeError> {
    validate(&target.address, opts)?;
    let host = target.address.trim().to_string();
    let timeout = target.timeout;

    // Resolve before spawn_blocking; DNS is async
    let ip = cancellable(cancel, async {
        let addrs = resolve(&host, 0, Instant::now() + timeout, timeout).await?;
        Ok::<_, ProbeError>(addrs[0].ip())
    })
    .await?;

    let opts = opts.clone();
    let blocking_cancel = cancel.clone();
    let task = tokio::task::spawn_blocking(move || {
        let opened = capability.open(ip, opts.variant);
        if blocking_cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let socket = opened?;
        match opts.variant {
            IcmpVariant::Ping => ping::run(&socket, ip, &opts, timeout, &blocking_cancel),
            IcmpVariant::Traceroute => traceroute::run(&socket, ip, &opts, timeout, &blocking_cancel),
        }
    });

    // always joined: the blocking side polls `cancel` and closes the socket on return
    task.await
        .map_err(|e| ProbeError::Internal(format!("ICMP task failed: {}", e)))?
}
