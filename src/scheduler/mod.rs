//! Scheduler module for running probe passes over all targets.
//!
//! A single control loop owns the periodic timer and executes runs inline,
//! so scheduled and manual runs never overlap.

mod run;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::model::{DeviceIdentity, ProbeTarget, RunTrigger, ScheduleRun};
use crate::probe::{NetworkProber, Prober};
use crate::upload::Uploader;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("a manual run is already queued")]
    TriggerPending,
    #[error("scheduler stopped before the run could start")]
    Stopped,
    #[error("run interval must be positive")]
    InvalidInterval,
}

/// What `stop()` does with a run that is still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// Cancel in-flight probes; unfinished targets are reported as cancelled.
    #[default]
    Cancel,
    /// Let the in-flight run finish.
    Drain,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub concurrency: usize,
    pub stop_policy: StopPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            stop_policy: StopPolicy::Cancel,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Stopped,
    Running,
}

/// Read-only view of the scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerState {
    pub lifecycle: Lifecycle,
    pub run_counter: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub upload_failures: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_finished: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub in_progress: bool,
}

type TriggerRequest = oneshot::Sender<ScheduleRun>;

struct Shared {
    targets: Vec<Arc<ProbeTarget>>,
    options: SchedulerOptions,
    identity: DeviceIdentity,
    uploader: Arc<dyn Uploader>,
    prober: Arc<dyn Prober>,
    state: Mutex<SchedulerState>,
    /// Serializes runs, including inline runs while stopped.
    run_gate: Mutex<()>,
    /// Cancelled by `stop()` so inline runs end with the scheduler.
    halt: Mutex<CancellationToken>,
    uploads: TaskTracker,
}

struct ControlLoop {
    shutdown: CancellationToken,
    triggers: mpsc::Sender<TriggerRequest>,
    handle: JoinHandle<()>,
}

/// Runs all configured targets on an interval or on demand.
pub struct Scheduler {
    shared: Arc<Shared>,
    control: Mutex<Option<ControlLoop>>,
}

impl Scheduler {
    pub fn new(
        targets: Vec<ProbeTarget>,
        options: SchedulerOptions,
        identity: DeviceIdentity,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        Self::with_prober(targets, options, identity, uploader, Arc::new(NetworkProber))
    }

    pub fn with_prober(
        targets: Vec<ProbeTarget>,
        options: SchedulerOptions,
        identity: DeviceIdentity,
        uploader: Arc<dyn Uploader>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                targets: targets.into_iter().map(Arc::new).collect(),
                options,
                identity,
                uploader,
                prober,
                state: Mutex::new(SchedulerState::default()),
                run_gate: Mutex::new(()),
                halt: Mutex::new(CancellationToken::new()),
                uploads: TaskTracker::new(),
            }),
            control: Mutex::new(None),
        }
    }

    /// Enter Running. A no-op when already running.
    pub async fn start(&self, interval: Duration, run_on_startup: bool) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }

        let mut control = self.control.lock().await;
        if control.is_some() {
            tracing::debug!("Scheduler already running");
            return Ok(());
        }

        let first_fire = Instant::now() + interval;
        {
            let mut state = self.shared.state.lock().await;
            state.lifecycle = Lifecycle::Running;
            state.next_run_at = wall_clock(first_fire);
        }

        let shutdown = CancellationToken::new();
        let (triggers, requests) = mpsc::channel(1);
        let handle = tokio::spawn(control_loop(
            self.shared.clone(),
            interval,
            first_fire,
            run_on_startup,
            shutdown.clone(),
            requests,
        ));

        *control = Some(ControlLoop {
            shutdown,
            triggers,
            handle,
        });

        tracing::info!(
            "Scheduler started with {} targets, interval {:?}",
            self.shared.targets.len(),
            interval
        );
        Ok(())
    }

    /// Stop the control loop and wait for the in-flight run and pending uploads.
    ///
    /// Inline runs started by `trigger_now` while stopped are cancelled (or
    /// drained) and waited for as well.
    pub async fn stop(&self) {
        // held until the state is updated so a concurrent start() cannot interleave
        let mut control = self.control.lock().await;

        let halt = self.shared.halt.lock().await.clone();
        halt.cancel();

        if let Some(control) = control.take() {
            if self.shared.options.stop_policy == StopPolicy::Drain {
                tracing::info!("Scheduler stopping; waiting for the current run to finish");
            }
            control.shutdown.cancel();
            if let Err(e) = control.handle.await {
                tracing::error!("Scheduler control loop failed: {}", e);
            }
        }

        // an inline run hands off its upload before releasing the gate
        drop(self.shared.run_gate.lock().await);

        self.shared.uploads.close();
        self.shared.uploads.wait().await;
        self.shared.uploads.reopen();
        *self.shared.halt.lock().await = CancellationToken::new();

        let mut state = self.shared.state.lock().await;
        if state.lifecycle == Lifecycle::Running {
            tracing::info!("Scheduler stopped");
        }
        state.lifecycle = Lifecycle::Stopped;
        state.next_run_at = None;
        drop(control);
    }

    /// Run all targets out of band and return the completed run.
    ///
    /// While running, the request is queued behind any run in progress and
    /// the periodic timer is left alone. While stopped, the run executes
    /// inline.
    pub async fn trigger_now(&self) -> Result<ScheduleRun, SchedulerError> {
        let triggers = self.control.lock().await.as_ref().map(|c| c.triggers.clone());

        let Some(triggers) = triggers else {
            let cancel = self.shared.run_token(&*self.shared.halt.lock().await);
            return Ok(self.shared.run_once(RunTrigger::Manual, cancel).await);
        };

        let (reply, response) = oneshot::channel();
        triggers.try_send(reply).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("Manual trigger rejected: a manual run is already queued");
                SchedulerError::TriggerPending
            }
            mpsc::error::TrySendError::Closed(_) => SchedulerError::Stopped,
        })?;

        response.await.map_err(|_| SchedulerError::Stopped)
    }

    pub async fn snapshot(&self) -> SchedulerState {
        self.shared.state.lock().await.clone()
    }

    pub fn target_count(&self) -> usize {
        self.shared.targets.len()
    }
}

/// Wall-clock time of a monotonic instant, for reporting.
fn wall_clock(at: Instant) -> Option<DateTime<Utc>> {
    let until = at.saturating_duration_since(Instant::now());
    chrono::Duration::from_std(until).ok().map(|d| Utc::now() + d)
}

/// First instant after now on the `interval` grid that starts at `fire`.
fn next_on_grid(mut fire: Instant, interval: Duration) -> Instant {
    let now = Instant::now();
    while fire <= now {
        fire += interval;
    }
    fire
}

async fn control_loop(
    shared: Arc<Shared>,
    interval: Duration,
    first_fire: Instant,
    run_on_startup: bool,
    shutdown: CancellationToken,
    mut requests: mpsc::Receiver<TriggerRequest>,
) {
    let mut next_fire = first_fire;

    if run_on_startup {
        shared.run_once(RunTrigger::Startup, shared.run_token(&shutdown)).await;
        if next_fire <= Instant::now() {
            next_fire = Instant::now() + interval;
            shared.set_next_run(next_fire).await;
        }
    }

    let mut ticker = interval_at(next_fire, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(reply) = requests.recv() => {
                // manual runs leave the timer alone
                let run = shared.run_once(RunTrigger::Manual, shared.run_token(&shutdown)).await;
                let _ = reply.send(run);
            }
            fired = ticker.tick() => {
                shared.run_once(RunTrigger::Scheduled, shared.run_token(&shutdown)).await;
                next_fire = next_on_grid(fired + interval, interval);
                shared.set_next_run(next_fire).await;
            }
        }
    }
}

impl Shared {
    fn run_token(&self, shutdown: &CancellationToken) -> CancellationToken {
        match self.options.stop_policy {
            StopPolicy::Cancel => shutdown.child_token(),
            StopPolicy::Drain => CancellationToken::new(),
        }
    }

    async fn set_next_run(&self, fire: Instant) {
        self.state.lock().await.next_run_at = wall_clock(fire);
    }

    async fn run_once(self: &Arc<Self>, trigger: RunTrigger, cancel: CancellationToken) -> ScheduleRun {
        let _gate = self.run_gate.lock().await;

        let started_at = Utc::now();
        let run_id = {
            let mut state = self.state.lock().await;
            state.run_counter += 1;
            state.in_progress = true;
            state.last_run_started = Some(started_at);
            state.run_counter
        };

        tracing::info!(run_id, targets = self.targets.len(), trigger = ?trigger, "Run started");

        let results = run::execute_targets(&self.targets, self.prober.clone(), self.options.concurrency, &cancel).await;
        let run = ScheduleRun::new(run_id, trigger, self.identity.clone(), started_at, Utc::now(), results);

        {
            let mut state = self.state.lock().await;
            state.succeeded += run.succeeded as u64;
            state.failed += run.failed as u64;
            state.cancelled += run.cancelled as u64;
            state.in_progress = false;
            state.last_run_finished = Some(run.finished_at);
        }

        tracing::info!(
            run_id,
            succeeded = run.succeeded,
            failed = run.failed,
            cancelled = run.cancelled,
            "Run finished"
        );

        self.hand_off(run.clone());
        run
    }

    /// Upload in the background; failures are counted and logged only.
    fn hand_off(self: &Arc<Self>, run: ScheduleRun) {
        let shared = self.clone();
        self.uploads.spawn(async move {
            if let Err(e) = shared.uploader.upload(&run).await {
                tracing::warn!(run_id = run.run_id, "Upload failed: {}", e);
                shared.state.lock().await.upload_failures += 1;
            }
        });
    }
}
