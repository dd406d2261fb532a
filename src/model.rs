//! Probe targets, normalized probe results and schedule runs.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol family of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    Http,
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolFamily::Http => "http",
            ProtocolFamily::Tcp => "tcp",
            ProtocolFamily::Udp => "udp",
            ProtocolFamily::Icmp => "icmp",
        };
        f.write_str(s)
    }
}

/// HTTP protocol negotiation preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpVersion {
    #[default]
    Auto,
    Http1,
    Http2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpVariant {
    #[default]
    Raw,
    Tls,
    Ssh,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpVariant {
    #[default]
    Dns,
    Raw,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcmpVariant {
    #[default]
    Ping,
    Traceroute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub version: HttpVersion,
    pub method: String,
    pub verify_tls: bool,
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            version: HttpVersion::Auto,
            method: "GET".to_string(),
            verify_tls: true,
            user_agent: concat!("netpulse/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpOptions {
    pub variant: TcpVariant,
    pub verify_tls: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            variant: TcpVariant::Raw,
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpOptions {
    pub variant: UdpVariant,
    /// Name queried by the DNS variant.
    pub query: String,
    /// Opaque payload sent by the raw variant.
    pub payload: String,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            variant: UdpVariant::Dns,
            query: "example.com".to_string(),
            payload: "netpulse".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpOptions {
    pub variant: IcmpVariant,
    /// Echo requests per ping burst.
    pub count: u32,
    /// Inter-packet interval of a ping burst.
    pub interval_ms: u64,
    pub max_hops: u8,
    pub attempts_per_hop: u32,
    /// Echo payload bytes after the 8 byte ICMP header.
    pub payload_size: usize,
}

impl Default for IcmpOptions {
    fn default() -> Self {
        Self {
            variant: IcmpVariant::Ping,
            count: 4,
            interval_ms: 1000,
            max_hops: 30,
            attempts_per_hop: 3,
            payload_size: 56,
        }
    }
}

impl IcmpOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Protocol family, variant and protocol-specific parameters of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProbeSpec {
    Http(HttpOptions),
    Tcp(TcpOptions),
    Udp(UdpOptions),
    Icmp(IcmpOptions),
}

impl ProbeSpec {
    pub fn family(&self) -> ProtocolFamily {
        match self {
            ProbeSpec::Http(_) => ProtocolFamily::Http,
            ProbeSpec::Tcp(_) => ProtocolFamily::Tcp,
            ProbeSpec::Udp(_) => ProtocolFamily::Udp,
            ProbeSpec::Icmp(_) => ProtocolFamily::Icmp,
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            ProbeSpec::Http(o) => match o.version {
                HttpVersion::Auto => "auto",
                HttpVersion::Http1 => "http1",
                HttpVersion::Http2 => "http2",
            },
            ProbeSpec::Tcp(o) => match o.variant {
                TcpVariant::Raw => "raw",
                TcpVariant::Tls => "tls",
                TcpVariant::Ssh => "ssh",
            },
            ProbeSpec::Udp(o) => match o.variant {
                UdpVariant::Dns => "dns",
                UdpVariant::Raw => "raw",
            },
            ProbeSpec::Icmp(o) => match o.variant {
                IcmpVariant::Ping => "ping",
                IcmpVariant::Traceroute => "traceroute",
            },
        }
    }
}

/// A configured destination. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub name: String,
    /// URL for HTTP, `host:port` for TCP/UDP, bare host for ICMP.
    pub address: String,
    /// Per-probe deadline; per packet for ICMP.
    pub timeout: Duration,
    pub spec: ProbeSpec,
}

impl ProbeTarget {
    pub fn new(name: impl Into<String>, address: impl Into<String>, timeout: Duration, spec: ProbeSpec) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            timeout,
            spec,
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.spec.family()
    }

    pub fn reference(&self) -> TargetRef {
        TargetRef {
            name: self.name.clone(),
            address: self.address.clone(),
            protocol: self.family(),
            variant: self.spec.variant_name().to_string(),
        }
    }
}

/// Serializable reference to the target a result belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetRef {
    pub name: String,
    pub address: String,
    pub protocol: ProtocolFamily,
    pub variant: String,
}

/// Error classification attached to failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Connection,
    Timeout,
    ProtocolMismatch,
    Permission,
    Internal,
    Cancelled,
}

/// Which phase of a probe ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    Resolve,
    Connect,
    Handshake,
    Read,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutPhase::Resolve => "resolve",
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Handshake => "handshake",
            TimeoutPhase::Read => "read",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeFailure {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<TimeoutPhase>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpMetrics {
    pub dns_ms: f64,
    pub connect_ms: f64,
    /// Zero for plaintext requests.
    pub tls_ms: f64,
    pub ttfb_ms: f64,
    pub transfer_ms: f64,
    pub total_ms: f64,
    pub status_code: u16,
    pub bytes_transferred: u64,
    /// Megabits per second over `total_ms`; only set when bytes were received.
    pub throughput_mbps: Option<f64>,
    pub http_version: String,
    pub remote_addr: String,
}

impl HttpMetrics {
    pub fn phase_sum_ms(&self) -> f64 {
        self.dns_ms + self.connect_ms + self.tls_ms + self.ttfb_ms + self.transfer_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcpMetrics {
    pub resolve_ms: f64,
    pub connect_ms: f64,
    /// TLS handshake or SSH banner read; zero for raw connects.
    pub handshake_ms: f64,
    pub tls_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub server_banner: Option<String>,
    pub remote_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UdpMetrics {
    pub round_trip_ms: Option<f64>,
    pub response_payload_size: usize,
    pub timed_out: bool,
    pub dns_rcode: Option<u8>,
    pub remote_addr: String,
}

/// One traceroute hop. `address` and `rtt_ms` are `None` when no router
/// answered at this hop-limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    pub hop_index: u8,
    pub address: Option<IpAddr>,
    pub rtt_ms: Option<f64>,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address, self.rtt_ms) {
            (Some(addr), Some(rtt)) => write!(f, "{:>2}  {}  {:.3} ms", self.hop_index, addr, rtt),
            _ => write!(f, "{:>2}  unknown  *", self.hop_index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IcmpMetrics {
    pub sent_count: u32,
    pub received_count: u32,
    pub loss_percent: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub jitter_ms: f64,
    pub stddev_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    /// Empty for ping.
    pub hops: Vec<Hop>,
    /// Traceroute only: whether the destination answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reached: Option<bool>,
}

impl IcmpMetrics {
    pub fn from_stats(stats: &crate::stats::LatencyStats, hops: Vec<Hop>, reached: Option<bool>) -> Self {
        Self {
            sent_count: stats.sent,
            received_count: stats.received,
            loss_percent: stats.loss_percent,
            min_ms: stats.min_ms,
            max_ms: stats.max_ms,
            avg_ms: stats.avg_ms,
            jitter_ms: stats.jitter_ms,
            stddev_ms: stats.stddev_ms,
            median_ms: stats.median_ms,
            p95_ms: stats.p95_ms,
            hops,
            reached,
        }
    }
}

/// Protocol-specific metrics payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProbeMetrics {
    Http(HttpMetrics),
    Tcp(TcpMetrics),
    Udp(UdpMetrics),
    Icmp(IcmpMetrics),
}

/// Normalized outcome of one probe execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub target: TargetRef,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    pub error: Option<ProbeFailure>,
    pub metrics: Option<ProbeMetrics>,
}

impl ProbeResult {
    pub fn cancelled(target: TargetRef, started_at: DateTime<Utc>) -> Self {
        Self {
            target,
            started_at,
            duration_ms: 0.0,
            success: false,
            error: Some(ProbeFailure {
                kind: ErrorKind::Cancelled,
                phase: None,
                message: "run cancelled before the probe completed".to_string(),
            }),
            metrics: None,
        }
    }

    pub fn internal(target: TargetRef, started_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            target,
            started_at,
            duration_ms: 0.0,
            success: false,
            error: Some(ProbeFailure {
                kind: ErrorKind::Internal,
                phase: None,
                message: message.into(),
            }),
            metrics: None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Cancelled)
    }

    pub fn is_failed(&self) -> bool {
        !self.success && !self.is_cancelled()
    }
}

/// What started a schedule run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Startup,
    Scheduled,
    Manual,
}

/// Identity attached to every run for upload tagging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub serial: String,
}

/// One pass over the full target set, in configured target order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRun {
    pub run_id: u64,
    pub trigger: RunTrigger,
    pub device: DeviceIdentity,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub results: Vec<ProbeResult>,
}

impl ScheduleRun {
    pub fn new(
        run_id: u64,
        trigger: RunTrigger,
        device: DeviceIdentity,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: Vec<ProbeResult>,
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let cancelled = results.iter().filter(|r| r.is_cancelled()).count();
        let failed = results.len() - succeeded - cancelled;
        Self {
            run_id,
            trigger,
            device,
            started_at,
            finished_at,
            succeeded,
            failed,
            cancelled,
            results,
        }
    }

    /// True only when every target failed; partial failures are a successful run.
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.failed == self.results.len()
    }
}
