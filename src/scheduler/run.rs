//! Fan-out of one run over all targets with bounded concurrency.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::model::{ProbeResult, ProbeTarget};
use crate::probe::Prober;

/// Probe every target, at most `concurrency` at a time.
///
/// Workers report through one channel to a single aggregator; the returned
/// results follow target order. Targets not probed before `cancel` fires are
/// reported as cancelled.
pub(crate) async fn execute_targets(
    targets: &[Arc<ProbeTarget>],
    prober: Arc<dyn Prober>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Vec<ProbeResult> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<(usize, ProbeResult)>(targets.len().max(1));
    let mut workers = JoinSet::new();

    for (index, target) in targets.iter().enumerate() {
        let semaphore = semaphore.clone();
        let prober = prober.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        let target = target.clone();

        workers.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };

            let result = match permit {
                Some(_permit) => prober.probe(target, cancel).await,
                None => ProbeResult::cancelled(target.reference(), Utc::now()),
            };
            let _ = tx.send((index, result)).await;
        });
    }
    drop(tx);

    let mut slots: Vec<Option<ProbeResult>> = (0..targets.len()).map(|_| None).collect();
    while let Some((index, result)) = rx.recv().await {
        slots[index] = Some(result);
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Probe worker failed: {}", e);
        }
    }

    slots
        .into_iter()
        .zip(targets)
        .map(|(slot, target)| {
            slot.unwrap_or_else(|| {
                if cancel.is_cancelled() {
                    ProbeResult::cancelled(target.reference(), Utc::now())
                } else {
                    ProbeResult::internal(target.reference(), Utc::now(), "probe worker exited without a result")
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorKind, ProbeSpec, TcpOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn targets(n: usize) -> Vec<Arc<ProbeTarget>> {
        (0..n)
            .map(|i| {
                Arc::new(ProbeTarget::new(
                    format!("t{}", i),
                    format!("10.0.0.{}:22", i),
                    Duration::from_secs(1),
                    ProbeSpec::Tcp(TcpOptions::default()),
                ))
            })
            .collect()
    }

    fn ok(target: &ProbeTarget) -> ProbeResult {
        ProbeResult {
            target: target.reference(),
            started_at: Utc::now(),
            duration_ms: 0.0,
            success: true,
            error: None,
            metrics: None,
        }
    }

    /// Later targets finish first; tracks peak parallelism.
    #[derive(Default)]
    struct ReverseDelay {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Prober for ReverseDelay {
        async fn probe(&self, target: Arc<ProbeTarget>, _cancel: CancellationToken) -> ProbeResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let index: u64 = target.name[1..].parse().unwrap();
            tokio::time::sleep(Duration::from_millis(50 - index * 10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            ok(&target)
        }
    }

    struct Panicking;

    #[async_trait]
    impl Prober for Panicking {
        async fn probe(&self, target: Arc<ProbeTarget>, _cancel: CancellationToken) -> ProbeResult {
            if target.name == "t1" {
                panic!("prober bug");
            }
            ok(&target)
        }
    }

    #[tokio::test]
    async fn test_results_keep_target_order() {
        let prober = Arc::new(ReverseDelay::default());
        let results = execute_targets(&targets(5), prober.clone(), 2, &CancellationToken::new()).await;

        let names: Vec<_> = results.iter().map(|r| r.target.name.as_str()).collect();
        assert_eq!(names, ["t0", "t1", "t2", "t3", "t4"]);
        assert!(results.iter().all(|r| r.success));
        assert!(prober.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = execute_targets(&targets(3), Arc::new(ReverseDelay::default()), 1, &cancel).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_cancelled()));
    }

    #[tokio::test]
    async fn test_panicking_prober_does_not_abort_run() {
        let results = execute_targets(&targets(3), Arc::new(Panicking), 3, &CancellationToken::new()).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Internal));
        assert!(results[2].success);
    }

    #[tokio::test]
    async fn test_empty_target_list() {
        let results = execute_targets(&[], Arc::new(Panicking), 4, &CancellationToken::new()).await;
        assert!(results.is_empty());
    }
}
