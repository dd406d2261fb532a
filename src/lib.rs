//! netpulse - multi-protocol network performance probes.
//!
//! HTTP, TCP, UDP and ICMP probes with phase timing and loss/jitter
//! statistics, run on an interval or on demand by a [`Scheduler`].

pub mod config;
pub mod model;
pub mod probe;
pub mod scheduler;
pub mod stats;
pub mod upload;

pub use config::{AppConfig, ConfigError};
pub use model::{ProbeMetrics, ProbeResult, ProbeTarget, ScheduleRun};
pub use probe::{dispatch, NetworkProber, ProbeError, Prober};
pub use scheduler::{Scheduler, SchedulerError, SchedulerOptions, SchedulerState, StopPolicy};
pub use upload::{HttpUploader, LogUploader, UploadError, Uploader};
