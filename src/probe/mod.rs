//! Probe module for network performance tests.
//!
//! Supports HTTP, TCP, UDP and ICMP probes. Every probe is a stateless
//! function of (target, options, cancellation token) and owns its socket for
//! its whole lifetime.

mod dns;
mod http;
mod icmp;
mod tcp;
mod tls;
mod udp;

pub use http::run_http;
pub use icmp::{icmp_capability, run_icmp, IcmpCapability};
pub use tcp::run_tcp;
pub use udp::run_udp;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::model::{
    ErrorKind, ProbeFailure, ProbeMetrics, ProbeResult, ProbeSpec, ProbeTarget, TimeoutPhase,
    UdpVariant,
};
use crate::stats::Timer;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("name resolution failed: {0}")]
    Resolution(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("probe cancelled")]
    Cancelled,
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Config(_) => ErrorKind::Configuration,
            ProbeError::Resolution(_) => ErrorKind::Resolution,
            ProbeError::Connection(_) | ProbeError::Tls(_) => ErrorKind::Connection,
            ProbeError::Timeout { .. } => ErrorKind::Timeout,
            ProbeError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            ProbeError::Permission(_) => ErrorKind::Permission,
            ProbeError::Internal(_) => ErrorKind::Internal,
            ProbeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn phase(&self) -> Option<TimeoutPhase> {
        match self {
            ProbeError::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn to_failure(&self) -> ProbeFailure {
        ProbeFailure {
            kind: self.kind(),
            phase: self.phase(),
            message: self.to_string(),
        }
    }
}

/// Runs probes on behalf of the scheduler.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: Arc<ProbeTarget>, cancel: CancellationToken) -> ProbeResult;
}

/// Prober that performs real network probes through [`dispatch`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: Arc<ProbeTarget>, cancel: CancellationToken) -> ProbeResult {
        dispatch(target, cancel).await
    }
}

/// Run the probe matching the target and normalize its outcome.
///
/// Never fails: configuration errors, probe errors and panics all come back
/// as a `ProbeResult` with `success == false`.
pub async fn dispatch(target: Arc<ProbeTarget>, cancel: CancellationToken) -> ProbeResult {
    // Spread probe starts to avoid synchronized bursts
    let stagger = Duration::from_millis(rand::random::<u64>() % 100);
    if cancellable(&cancel, async {
        tokio::time::sleep(stagger).await;
        Ok(())
    })
    .await
    .is_err()
    {
        return ProbeResult::cancelled(target.reference(), Utc::now());
    }

    let task_target = target.clone();
    guarded(&target, async move { run_probe(&task_target, &cancel).await }).await
}

/// Run a probe future on its own task, converting panics into internal errors.
pub(crate) async fn guarded<F>(target: &ProbeTarget, probe: F) -> ProbeResult
where
    F: Future<Output = Result<ProbeMetrics, ProbeError>> + Send + 'static,
{
    let started_at = Utc::now();
    let timer = Timer::start();

    let outcome = match tokio::spawn(probe).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(ProbeError::Internal(format!(
            "probe panicked: {}",
            panic_message(e)
        ))),
        Err(e) => Err(ProbeError::Internal(format!("probe task failed: {}", e))),
    };

    normalize(target, started_at, timer.elapsed_ms(), outcome)
}

/// Route a target to its probe without the panic boundary.
pub async fn run_probe(
    target: &ProbeTarget,
    cancel: &CancellationToken,
) -> Result<ProbeMetrics, ProbeError> {
    validate_target(target)?;

    match &target.spec {
        ProbeSpec::Http(opts) => run_http(target, opts, cancel).await.map(ProbeMetrics::Http),
        ProbeSpec::Tcp(opts) => run_tcp(target, opts, cancel).await.map(ProbeMetrics::Tcp),
        ProbeSpec::Udp(opts) => run_udp(target, opts, cancel).await.map(ProbeMetrics::Udp),
        ProbeSpec::Icmp(opts) => run_icmp(target, opts, cancel).await.map(ProbeMetrics::Icmp),
    }
}

fn normalize(
    target: &ProbeTarget,
    started_at: DateTime<Utc>,
    duration_ms: f64,
    outcome: Result<ProbeMetrics, ProbeError>,
) -> ProbeResult {
    let reference = target.reference();
    let (metrics, error) = match outcome {
        Ok(metrics) => {
            let verdict = verdict(target, &metrics);
            (Some(metrics), verdict)
        }
        Err(e) => (None, Some(e)),
    };

    if let Some(e) = &error {
        tracing::debug!(
            target_name = %target.name,
            kind = ?e.kind(),
            "probe failed: {}",
            e
        );
    }

    ProbeResult {
        target: reference,
        started_at,
        duration_ms,
        success: error.is_none(),
        error: error.as_ref().map(ProbeError::to_failure),
        metrics,
    }
}

/// Failures that still carry metrics: UDP silence and ICMP total loss.
fn verdict(target: &ProbeTarget, metrics: &ProbeMetrics) -> Option<ProbeError> {
    let silent = match metrics {
        ProbeMetrics::Udp(m) => m.timed_out,
        ProbeMetrics::Icmp(m) => m.received_count == 0,
        ProbeMetrics::Http(_) | ProbeMetrics::Tcp(_) => false,
    };
    silent.then_some(ProbeError::Timeout {
        phase: TimeoutPhase::Read,
        after: target.timeout,
    })
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Check a target before any network call.
pub fn validate_target(target: &ProbeTarget) -> Result<(), ProbeError> {
    if target.address.trim().is_empty() {
        return Err(ProbeError::Config("address is empty".to_string()));
    }
    if target.timeout.is_zero() {
        return Err(ProbeError::Config("timeout must be positive".to_string()));
    }

    match &target.spec {
        ProbeSpec::Http(opts) => http::validate(&target.address, opts).map(|_| ()),
        ProbeSpec::Tcp(_) => split_host_port(&target.address, None).map(|_| ()),
        ProbeSpec::Udp(opts) => match opts.variant {
            UdpVariant::Dns => {
                split_host_port(&target.address, Some(dns::DNS_PORT))?;
                dns::validate_name(&opts.query)
            }
            UdpVariant::Raw => split_host_port(&target.address, None).map(|_| ()),
        },
        ProbeSpec::Icmp(opts) => icmp::validate(&target.address, opts),
    }
}

/// Split `host:port` or `[v6]:port`, falling back to `default_port` when absent.
pub(crate) fn split_host_port(
    address: &str,
    default_port: Option<u16>,
) -> Result<(String, u16), ProbeError> {
    let address = address.trim();

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProbeError::Config(format!("unterminated IPv6 literal: {}", address)))?;
        (host, tail.strip_prefix(':'))
    } else {
        match address.rsplit_once(':') {
            // a bare IPv6 literal has several colons and no port
            Some((host, _)) if host.contains(':') => (address, None),
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        }
    };

    if host.is_empty() {
        return Err(ProbeError::Config(format!("missing host in {}", address)));
    }

    let port = match (port, default_port) {
        (Some(p), _) => p
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ProbeError::Config(format!("invalid port in {}", address)))?,
        (None, Some(default)) => default,
        (None, None) => {
            return Err(ProbeError::Config(format!(
                "address {} needs an explicit port",
                address
            )))
        }
    };

    Ok((host.to_string(), port))
}

/// Resolve a host within the remaining probe budget.
pub(crate) async fn resolve(
    host: &str,
    port: u16,
    deadline: Instant,
    budget: Duration,
) -> Result<Vec<SocketAddr>, ProbeError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = within(deadline, TimeoutPhase::Resolve, budget, tokio::net::lookup_host((host, port)))
        .await?
        .map_err(|e| ProbeError::Resolution(format!("{}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Resolution(format!("no addresses found for {}", host)));
    }
    Ok(addrs)
}

/// Bound a future by a deadline, reporting which phase ran out of time.
pub(crate) async fn within<F: Future>(
    deadline: Instant,
    phase: TimeoutPhase,
    budget: Duration,
    fut: F,
) -> Result<F::Output, ProbeError> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| ProbeError::Timeout { phase, after: budget })
}

/// Race a probe future against cancellation; the future is dropped on cancel.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        result = fut => result,
    }
}
