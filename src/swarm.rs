//! The Concurrent Swarm Engine (C5).
//!
//! Concurrency bound is grounded on `tower-resilience-bulkhead`'s `Bulkhead`
//! service: an `Arc<Semaphore>` sized to `max_concurrency`, one
//! `acquire_owned` permit per in-flight call, dropped on completion. Swarm
//! generalizes this from "one call" to "N URLs through one driver".
//! Per-request isolation uses `tokio::spawn` + `JoinSet` so a panicking
//! worker is caught and surfaced as a failed outcome rather than crashing
//! sibling work. Cancellation uses a plain `Arc<AtomicBool>` +
//! `tokio::sync::Notify` pair — the teacher pack does not depend on
//! `tokio-util`, so this does not introduce it either.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::drivers::TierDriver;
use crate::outcome::{AcquisitionOutcome, ErrorKind};
use crate::request::UrlRequest;
use crate::tier::Tier;

/// Aggregate statistics for one swarm run.
#[derive(Debug, Clone, Default)]
pub struct SwarmStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Synchronous progress callback; invoked after each outcome completes.
/// Must not block — it runs inline on the engine's completion path.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Cancellation handle for an in-flight swarm run.
#[derive(Clone, Default)]
pub struct SwarmCancellation {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl SwarmCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs a batch of [`UrlRequest`]s through one [`TierDriver`] under a
/// concurrency bound.
pub struct SwarmEngine {
    max_concurrency: usize,
}

impl SwarmEngine {
    pub fn new(max_concurrency: usize) -> Self {
        assert!(max_concurrency > 0, "max_concurrency must be >= 1");
        Self { max_concurrency }
    }

    /// Runs every request in `requests` through `driver`, producing an
    /// index-aligned output vector. `proxy_for` is called per-request
    /// (typically backed by the Proxy Rotator) so proxy selection stays
    /// under the caller's control.
    pub async fn run<F, Fut>(
        &self,
        tier: Tier,
        driver: Arc<dyn TierDriver>,
        requests: Vec<UrlRequest>,
        proxy_for: F,
        progress: Option<ProgressCallback>,
        cancellation: SwarmCancellation,
    ) -> (Vec<AcquisitionOutcome>, SwarmStats)
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = String> + Send + 'static,
    {
        let total = requests.len();
        let mut results: Vec<Option<AcquisitionOutcome>> = (0..total).map(|_| None).collect();
        let mut stats = SwarmStats {
            total,
            ..Default::default()
        };

        if total == 0 {
            return (Vec::new(), stats);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let proxy_for = Arc::new(proxy_for);
        let mut join_set = JoinSet::new();
        let mut completed = 0usize;

        for (index, request) in requests.into_iter().enumerate() {
            if cancellation.is_cancelled() {
                stats.cancelled += 1;
                continue;
            }

            let semaphore = semaphore.clone();
            let driver = driver.clone();
            let proxy_for = proxy_for.clone();
            let cancellation = cancellation.clone();

            join_set.spawn(async move {
                let permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                if cancellation.is_cancelled() {
                    drop(permit);
                    return (
                        index,
                        AcquisitionOutcome::error(tier, ErrorKind::Cancelled, std::time::Duration::ZERO),
                    );
                }

                let proxy = proxy_for(index).await;
                let outcome = tokio::select! {
                    outcome = driver.execute(&request, &proxy, &Default::default()) => outcome,
                    _ = cancellation.notify.notified() => {
                        AcquisitionOutcome::error(tier, ErrorKind::Cancelled, std::time::Duration::ZERO)
                    }
                };
                drop(permit);
                (index, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    // A panicking worker is caught here rather than
                    // crashing sibling work.
                    log::warn!("swarm worker panicked: {join_err}");
                    stats.failed += 1;
                    completed += 1;
                    if let Some(cb) = &progress {
                        cb(completed, total);
                    }
                    continue;
                }
            };

            if outcome.ok {
                stats.succeeded += 1;
            } else if matches!(outcome.error_kind, Some(ErrorKind::Cancelled)) {
                stats.cancelled += 1;
            } else {
                stats.failed += 1;
            }

            results[index] = Some(outcome);
            completed += 1;
            if let Some(cb) = &progress {
                cb(completed, total);
            }
        }

        let outcomes = results
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.unwrap_or_else(|| {
                    AcquisitionOutcome::error(tier, ErrorKind::Cancelled, std::time::Duration::ZERO)
                        .with_proxy(format!("skipped-{index}"))
                })
            })
            .collect();

        (outcomes, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ScriptedOutcome, SimulatedDriver};
    use url::Url;

    fn requests(n: usize) -> Vec<UrlRequest> {
        (0..n)
            .map(|i| UrlRequest::new(Url::parse(&format!("https://example.com/{i}")).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let engine = SwarmEngine::new(4);
        let driver: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::always(
            Tier::T1,
            AcquisitionOutcome::success(Tier::T1, 200, vec![0; 100], std::time::Duration::ZERO),
        ));
        let (outcomes, stats) = engine
            .run(
                Tier::T1,
                driver,
                requests(0),
                |_| async { "direct".to_string() },
                None,
                SwarmCancellation::new(),
            )
            .await;
        assert!(outcomes.is_empty());
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn output_is_index_aligned_with_input() {
        let engine = SwarmEngine::new(2);
        let driver: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::always(
            Tier::T1,
            AcquisitionOutcome::success(Tier::T1, 200, vec![0; 100], std::time::Duration::ZERO),
        ));
        let (outcomes, stats) = engine
            .run(
                Tier::T1,
                driver,
                requests(20),
                |_| async { "direct".to_string() },
                None,
                SwarmCancellation::new(),
            )
            .await;
        assert_eq!(outcomes.len(), 20);
        assert_eq!(stats.succeeded, 20);
    }

    #[tokio::test]
    async fn respects_max_concurrency_bound() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct TrackingDriver {
            active: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait::async_trait]
        impl TierDriver for TrackingDriver {
            fn tier(&self) -> Tier {
                Tier::T1
            }

            async fn execute(
                &self,
                _request: &UrlRequest,
                proxy: &str,
                _session_headers: &std::collections::HashMap<String, String>,
            ) -> AcquisitionOutcome {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                AcquisitionOutcome::success(Tier::T1, 200, vec![0; 10], std::time::Duration::ZERO)
                    .with_proxy(proxy)
            }

            async fn cleanup(&self) {}
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let driver: Arc<dyn TierDriver> = Arc::new(TrackingDriver {
            active: active.clone(),
            peak: peak.clone(),
        });

        let engine = SwarmEngine::new(3);
        let (_, stats) = engine
            .run(
                Tier::T1,
                driver,
                requests(15),
                |_| async { "direct".to_string() },
                None,
                SwarmCancellation::new(),
            )
            .await;

        assert_eq!(stats.succeeded, 15);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn one_panicking_worker_does_not_cancel_siblings() {
        struct FlakyDriver;

        #[async_trait::async_trait]
        impl TierDriver for FlakyDriver {
            fn tier(&self) -> Tier {
                Tier::T1
            }

            async fn execute(
                &self,
                request: &UrlRequest,
                proxy: &str,
                _session_headers: &std::collections::HashMap<String, String>,
            ) -> AcquisitionOutcome {
                if request.url.path() == "/2" {
                    panic!("simulated driver crash");
                }
                AcquisitionOutcome::success(Tier::T1, 200, vec![0; 10], std::time::Duration::ZERO)
                    .with_proxy(proxy)
            }

            async fn cleanup(&self) {}
        }

        let driver: Arc<dyn TierDriver> = Arc::new(FlakyDriver);
        let engine = SwarmEngine::new(4);
        let (outcomes, stats) = engine
            .run(
                Tier::T1,
                driver,
                requests(5),
                |_| async { "direct".to_string() },
                None,
                SwarmCancellation::new(),
            )
            .await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 4);
    }

    #[tokio::test]
    async fn cancellation_skips_pending_and_aborts_in_flight() {
        let driver: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::new(
            Tier::T1,
            vec![ScriptedOutcome::new(AcquisitionOutcome::success(
                Tier::T1,
                200,
                vec![0; 10],
                std::time::Duration::ZERO,
            ))
            .with_delay(std::time::Duration::from_millis(200))],
        ));
        let engine = SwarmEngine::new(10);
        let cancellation = SwarmCancellation::new();
        cancellation.cancel();

        let (outcomes, stats) = engine
            .run(
                Tier::T1,
                driver,
                requests(5),
                |_| async { "direct".to_string() },
                None,
                cancellation,
            )
            .await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(stats.cancelled, 5);
    }
}
