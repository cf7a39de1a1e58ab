//! A scriptable driver used for T2-T5 (spec §1 puts their real browser
//! bindings out of scope) and for exercising the orchestrator, swarm engine,
//! and the spec's end-to-end seed scenarios deterministically.
//!
//! Grounded on the teacher's `#[cfg(test)]` fixture style (see
//! `challenges/solvers/access_denied.rs`'s `ResponseFixture` /
//! `StubProxyPool`): a small test double that hands back scripted values in
//! order rather than performing real I/O.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::TierDriver;
use crate::outcome::AcquisitionOutcome;
use crate::request::UrlRequest;
use crate::tier::Tier;

/// One scripted result: either a canned outcome, or a simulated delay
/// (useful for deadline-exceeded scenarios) paired with an outcome.
#[derive(Clone)]
pub struct ScriptedOutcome {
    pub outcome: AcquisitionOutcome,
    pub simulated_delay: Duration,
}

impl ScriptedOutcome {
    pub fn new(outcome: AcquisitionOutcome) -> Self {
        Self {
            outcome,
            simulated_delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.simulated_delay = delay;
        self
    }
}

/// Hands back queued [`ScriptedOutcome`]s in order; the last one repeats
/// once the queue is drained, so tests do not need to pad it to an exact
/// call count.
pub struct SimulatedDriver {
    tier: Tier,
    queue: Mutex<VecDeque<ScriptedOutcome>>,
    last: Mutex<Option<ScriptedOutcome>>,
}

impl SimulatedDriver {
    pub fn new(tier: Tier, script: Vec<ScriptedOutcome>) -> Self {
        Self {
            tier,
            queue: Mutex::new(script.into()),
            last: Mutex::new(None),
        }
    }

    /// Convenience constructor for a single fixed outcome.
    pub fn always(tier: Tier, outcome: AcquisitionOutcome) -> Self {
        Self::new(tier, vec![ScriptedOutcome::new(outcome)])
    }
}

#[async_trait]
impl TierDriver for SimulatedDriver {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn execute(
        &self,
        _request: &UrlRequest,
        proxy: &str,
        _session_headers: &HashMap<String, String>,
    ) -> AcquisitionOutcome {
        let next = {
            let mut queue = self.queue.lock().await;
            match queue.pop_front() {
                Some(scripted) => {
                    *self.last.lock().await = Some(scripted.clone());
                    scripted
                }
                None => self
                    .last
                    .lock()
                    .await
                    .clone()
                    .unwrap_or_else(|| {
                        ScriptedOutcome::new(AcquisitionOutcome::success(
                            self.tier,
                            200,
                            b"default scripted body".to_vec(),
                            Duration::ZERO,
                        ))
                    }),
            }
        };

        if next.simulated_delay > Duration::ZERO {
            tokio::time::sleep(next.simulated_delay).await;
        }

        next.outcome.with_proxy(proxy)
    }

    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ChallengeTag;
    use url::Url;

    #[tokio::test]
    async fn replays_script_then_repeats_last() {
        let driver = SimulatedDriver::new(
            Tier::T1,
            vec![
                ScriptedOutcome::new(AcquisitionOutcome::success(
                    Tier::T1,
                    403,
                    vec![],
                    Duration::ZERO,
                )),
                ScriptedOutcome::new(AcquisitionOutcome::success(
                    Tier::T1,
                    200,
                    vec![0; 100],
                    Duration::ZERO,
                )),
            ],
        );
        let request = UrlRequest::new(Url::parse("https://example.com").unwrap());
        let headers = HashMap::new();

        let first = driver.execute(&request, "direct", &headers).await;
        assert_eq!(first.status, Some(403));
        let second = driver.execute(&request, "direct", &headers).await;
        assert_eq!(second.status, Some(200));
        let third = driver.execute(&request, "direct", &headers).await;
        assert_eq!(third.status, Some(200));
        let _ = ChallengeTag::None;
    }
}
