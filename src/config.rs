//! Configuration module for netpulse.
//!
//! Loads a JSON file (path from `NETPULSE_CONFIG`, default `netpulse.json`)
//! and applies environment overrides on top.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{DeviceIdentity, ProbeSpec, ProbeTarget, ProtocolFamily};
use crate::probe::validate_target;
use crate::scheduler::{SchedulerOptions, StopPolicy};

pub const CONFIG_PATH_ENV: &str = "NETPULSE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "netpulse.json";
pub const DEFAULT_LOG_DIRECTIVE: &str = "netpulse=info";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub run_on_startup: bool,
    pub concurrency: usize,
    pub stop_policy: StopPolicy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            run_on_startup: true,
            concurrency: 8,
            stop_policy: StopPolicy::Cancel,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            concurrency: self.concurrency,
            stop_policy: self.stop_policy,
        }
    }
}

/// Per-protocol timeouts for targets without `timeout_secs`.
/// The ICMP value applies per packet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutDefaults {
    pub http_secs: f64,
    pub tcp_secs: f64,
    pub udp_secs: f64,
    pub icmp_secs: f64,
}

impl Default for TimeoutDefaults {
    fn default() -> Self {
        Self {
            http_secs: 30.0,
            tcp_secs: 10.0,
            udp_secs: 5.0,
            icmp_secs: 2.0,
        }
    }
}

impl TimeoutDefaults {
    pub fn for_family(&self, family: ProtocolFamily) -> f64 {
        match family {
            ProtocolFamily::Http => self.http_secs,
            ProtocolFamily::Tcp => self.tcp_secs,
            ProtocolFamily::Udp => self.udp_secs,
            ProtocolFamily::Icmp => self.icmp_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

/// One target entry; protocol options sit beside the common fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(flatten)]
    pub spec: ProbeSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub schedule: ScheduleConfig,
    pub defaults: TimeoutDefaults,
    pub device: DeviceIdentity,
    pub upload: UploadConfig,
    pub log_level: Option<String>,
    pub targets: Vec<TargetConfig>,
}

impl AppConfig {
    /// Load from the file named by `NETPULSE_CONFIG` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_with(path, |var| env::var(var).ok())
    }

    /// Load from `path`, taking overrides from `lookup` instead of the environment.
    pub fn load_with<P, F>(path: P, lookup: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let display = path.display().to_string();

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let mut cfg: AppConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;

        cfg.apply_overrides(lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `NETPULSE_*` overrides.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("NETPULSE_INTERVAL_SECS") {
            self.schedule.interval_secs = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "NETPULSE_INTERVAL_SECS",
                value,
            })?;
        }

        if let Some(value) = lookup("NETPULSE_CONCURRENCY") {
            self.schedule.concurrency = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "NETPULSE_CONCURRENCY",
                value,
            })?;
        }

        if let Some(url) = lookup("NETPULSE_UPLOAD_URL") {
            self.upload.url = Some(url);
        }

        if let Some(key) = lookup("NETPULSE_API_KEY") {
            self.upload.api_key = Some(key);
        }

        if let Some(level) = lookup("NETPULSE_LOG_LEVEL") {
            self.log_level = Some(level);
        }

        Ok(())
    }

    /// Reject structural problems. Per-target problems are left for
    /// [`report_target_problems`](Self::report_target_problems) and fail that
    /// target at run time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.interval_secs == 0 {
            return Err(ConfigError::Invalid("schedule.interval_secs must be positive".to_string()));
        }
        if self.schedule.concurrency == 0 {
            return Err(ConfigError::Invalid("schedule.concurrency must be positive".to_string()));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no targets configured".to_string()));
        }

        let d = &self.defaults;
        for (name, secs) in [
            ("http", d.http_secs),
            ("tcp", d.tcp_secs),
            ("udp", d.udp_secs),
            ("icmp", d.icmp_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(ConfigError::Invalid(format!("defaults.{}_secs must be positive", name)));
            }
        }
        Ok(())
    }

    /// Log targets that will fail at run time; returns how many.
    pub fn report_target_problems(&self) -> usize {
        let mut problems = 0;
        for target in self.targets() {
            if let Err(e) = validate_target(&target) {
                tracing::warn!(target_name = %target.name, "Target will fail at run time: {}", e);
                problems += 1;
            }
        }
        problems
    }

    /// Targets in configured order with defaults applied.
    pub fn targets(&self) -> Vec<ProbeTarget> {
        self.targets
            .iter()
            .map(|t| {
                let secs = t
                    .timeout_secs
                    .unwrap_or_else(|| self.defaults.for_family(t.spec.family()));
                // invalid timeouts become zero and are rejected at run time
                let timeout = Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO);
                let name = t
                    .name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| t.address.clone());
                ProbeTarget::new(name, t.address.clone(), timeout, t.spec.clone())
            })
            .collect()
    }

    /// Device identity, with the hostname taken from the environment when unset.
    pub fn identity(&self) -> DeviceIdentity {
        let mut identity = self.device.clone();
        if identity.hostname.is_empty() {
            identity.hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        }
        identity
    }

    /// `tracing` filter directive; a bare level applies to this crate.
    pub fn log_directive(&self) -> String {
        match self.log_level.as_deref().map(str::trim) {
            Some(level) if !level.is_empty() && !level.contains('=') => format!("netpulse={}", level),
            Some(directive) if !directive.is_empty() => directive.to_string(),
            _ => DEFAULT_LOG_DIRECTIVE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpVersion, IcmpVariant, TcpVariant};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE: &str = r#"{
        "schedule": { "interval_secs": 60, "concurrency": 2, "stop_policy": "drain" },
        "defaults": { "icmp_secs": 1 },
        "device": { "hostname": "edge-7", "serial": "ABC123" },
        "targets": [
            { "name": "site", "address": "https://example.test", "protocol": "http", "version": "http2", "timeout_secs": 5 },
            { "address": "192.0.2.1", "protocol": "icmp", "count": 4 },
            { "name": "ssh", "address": "10.0.0.1:22", "protocol": "tcp", "variant": "ssh" },
            { "name": "dns", "address": "1.1.1.1", "protocol": "udp" }
        ]
    }"#;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_load_sample() {
        let file = write_config(SAMPLE);
        let cfg = assert_ok!(AppConfig::load_with(file.path(), no_env));

        assert_eq!(cfg.schedule.interval(), Duration::from_secs(60));
        assert!(cfg.schedule.run_on_startup);
        assert_eq!(cfg.schedule.options().concurrency, 2);
        assert_eq!(cfg.schedule.stop_policy, StopPolicy::Drain);
        assert_eq!(cfg.identity().hostname, "edge-7");

        let targets = cfg.targets();
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[0].timeout, Duration::from_secs(5));
        assert!(matches!(&targets[0].spec, ProbeSpec::Http(o) if o.version == HttpVersion::Http2));
        // unnamed targets are named after their address
        assert_eq!(targets[1].name, "192.0.2.1");
        assert_eq!(targets[1].timeout, Duration::from_secs(1));
        assert!(matches!(&targets[1].spec, ProbeSpec::Icmp(o) if o.variant == IcmpVariant::Ping));
        assert!(matches!(&targets[2].spec, ProbeSpec::Tcp(o) if o.variant == TcpVariant::Ssh));
        assert_eq!(targets[2].timeout, Duration::from_secs(10));
        assert_eq!(targets[3].timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        let file = write_config(SAMPLE);
        let env: HashMap<&str, &str> = [
            ("NETPULSE_INTERVAL_SECS", "15"),
            ("NETPULSE_CONCURRENCY", "4"),
            ("NETPULSE_UPLOAD_URL", "https://collector.test"),
            ("NETPULSE_API_KEY", "k"),
            ("NETPULSE_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let cfg = AppConfig::load_with(file.path(), |var| env.get(var).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.schedule.interval_secs, 15);
        assert_eq!(cfg.schedule.concurrency, 4);
        assert_eq!(cfg.upload.url.as_deref(), Some("https://collector.test"));
        assert_eq!(cfg.upload.api_key.as_deref(), Some("k"));
        assert_eq!(cfg.log_directive(), "netpulse=debug");
    }

    #[test]
    fn test_bad_env_value() {
        let file = write_config(SAMPLE);
        let err = assert_err!(AppConfig::load_with(file.path(), |var| {
            (var == "NETPULSE_CONCURRENCY").then(|| "many".to_string())
        }));
        assert!(matches!(err, ConfigError::Env { var: "NETPULSE_CONCURRENCY", .. }));
    }

    #[test]
    fn test_structural_errors_reject_file() {
        let no_targets = write_config(r#"{ "targets": [] }"#);
        assert!(matches!(AppConfig::load_with(no_targets.path(), no_env), Err(ConfigError::Invalid(_))));

        let zero_interval = write_config(
            r#"{ "schedule": { "interval_secs": 0 }, "targets": [ { "address": "a:1", "protocol": "tcp" } ] }"#,
        );
        assert!(matches!(AppConfig::load_with(zero_interval.path(), no_env), Err(ConfigError::Invalid(_))));

        let unknown_protocol = write_config(r#"{ "targets": [ { "address": "a:1", "protocol": "sctp" } ] }"#);
        assert!(matches!(AppConfig::load_with(unknown_protocol.path(), no_env), Err(ConfigError::Parse { .. })));

        let unknown_variant =
            write_config(r#"{ "targets": [ { "address": "a:1", "protocol": "tcp", "variant": "quic" } ] }"#);
        assert!(matches!(AppConfig::load_with(unknown_variant.path(), no_env), Err(ConfigError::Parse { .. })));

        let missing = AppConfig::load_with("/nonexistent/netpulse.json", no_env);
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_per_target_problems_do_not_reject_file() {
        let file = write_config(
            r#"{ "targets": [
                { "name": "no-port", "address": "example.com", "protocol": "tcp" },
                { "name": "bad-timeout", "address": "a:1", "protocol": "tcp", "timeout_secs": -1 }
            ] }"#,
        );
        let cfg = assert_ok!(AppConfig::load_with(file.path(), no_env));
        assert_eq!(cfg.report_target_problems(), 2);
        let targets = cfg.targets();
        assert!(validate_target(&targets[0]).is_err());
        assert_eq!(targets[1].timeout, Duration::ZERO);
    }

    #[test]
    fn test_log_directive() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.log_directive(), DEFAULT_LOG_DIRECTIVE);
        cfg.log_level = Some("netpulse=trace,hyper=warn".to_string());
        assert_eq!(cfg.log_directive(), "netpulse=trace,hyper=warn");
    }
}
