//! The Tier Escalation Orchestrator (C7): the engine's central control loop.
//!
//! Wires together the Failure Classifier, Proxy Rotator, Session Store,
//! Tier Driver ladder, and CAPTCHA Task Queue into the single per-URL
//! algorithm spec'd as: inject any cached session, pick a proxy, run the
//! driver, record metrics, classify, and either return, retry, escalate, or
//! fall through to a human solver — all bounded by one overall deadline.
//!
//! Resolves spec Open Question (a): a request with `forced_tier` above T1
//! that still needs a manual solve enqueues a CAPTCHA task exactly like an
//! unforced request, and resumes the ladder at T1 on solve rather than at
//! the forced tier — the freshly cached clearance is cheapest to prove at
//! T1, and resuming above it would retry a tier already known to need help.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use uuid::Uuid;

use crate::captcha::{CaptchaError, CaptchaQueue, TerminalOutcome};
use crate::classifier::{classify, escalate_after_repeated_rate_limit, retry_after_delay, MAX_ATTEMPTS_PER_TIER};
use crate::config::TitanConfig;
use crate::drivers::TierDriver;
use crate::metrics::SharedMetrics;
use crate::outcome::{ChallengeTag, Classification, ErrorKind, OrchestrationOutcome};
use crate::proxy::{FailureSeverity, ProxyRotator, DIRECT_NO_PROXY};
use crate::request::UrlRequest;
use crate::session::{inject, SessionEntry, SessionStore};
use crate::tier::Tier;

/// Priority assigned to CAPTCHA tasks enqueued by the orchestrator itself.
/// Operator-facing tooling may enqueue at other priorities.
const DEFAULT_CAPTCHA_PRIORITY: i32 = 5;

/// Consecutive rate-limited outcomes at the same tier before rule 6's
/// "on repeat, challenge-escalate" clause kicks in instead of another
/// header-timed retry.
const RATE_LIMIT_REPEAT_THRESHOLD: u32 = 2;

pub struct Orchestrator {
    drivers: HashMap<Tier, Arc<dyn TierDriver>>,
    proxy: Arc<ProxyRotator>,
    sessions: Arc<dyn SessionStore>,
    captcha: Arc<CaptchaQueue>,
    metrics: SharedMetrics,
    deadline: Duration,
    captcha_ttl: chrono::Duration,
}

impl Orchestrator {
    pub fn new(
        drivers: HashMap<Tier, Arc<dyn TierDriver>>,
        proxy: Arc<ProxyRotator>,
        sessions: Arc<dyn SessionStore>,
        captcha: Arc<CaptchaQueue>,
        metrics: SharedMetrics,
        config: &TitanConfig,
    ) -> Self {
        Self {
            drivers,
            proxy,
            sessions,
            captcha,
            metrics,
            deadline: config.orchestration_deadline(),
            captcha_ttl: chrono::Duration::seconds(config.captcha.default_task_ttl_secs as i64),
        }
    }

    /// Run the full tier-escalation algorithm for one request.
    pub async fn acquire(&self, request: UrlRequest) -> OrchestrationOutcome {
        let run_started = Instant::now();
        let deadline_at = run_started + self.deadline;
        let domain = request.domain();
        let request_id = Uuid::new_v4();
        let task_hint = hash_domain(&domain);

        let mut tier = request.forced_tier.unwrap_or(Tier::T1);
        let mut escalation_path = Vec::new();
        let mut attempts_at_tier: u32 = 0;
        let mut rate_limit_hits_at_tier: u32 = 0;

        loop {
            if Instant::now() >= deadline_at {
                return self.finish(
                    Classification::Fatal,
                    None,
                    tier,
                    escalation_path,
                    run_started.elapsed(),
                    Vec::new(),
                    Some(ErrorKind::DeadlineExceeded),
                    Some("orchestration deadline exceeded".to_string()),
                    None,
                );
            }

            escalation_path.push(tier);

            let Some(driver) = self.drivers.get(&tier).cloned() else {
                return self.finish(
                    Classification::Fatal,
                    None,
                    tier,
                    escalation_path,
                    run_started.elapsed(),
                    Vec::new(),
                    Some(ErrorKind::DriverCrash),
                    Some(format!("no driver registered for {tier}")),
                    None,
                );
            };

            let mut headers = request.headers.clone();
            let cached = inject(self.sessions.as_ref(), &domain, &mut headers).await;
            if cached.is_some() {
                self.metrics.record_cached_session_hit(task_hint);
            }

            let proxy = match self.proxy.select(&domain).await {
                Ok(proxy) => proxy,
                Err(_) => {
                    return self.finish(
                        Classification::Fatal,
                        None,
                        tier,
                        escalation_path,
                        run_started.elapsed(),
                        Vec::new(),
                        Some(ErrorKind::ConnectError),
                        Some("no proxy available".to_string()),
                        None,
                    );
                }
            };

            let outcome = driver.execute(&request, &proxy, &headers).await;
            let (classification, next_tier) = classify(&outcome, tier);

            if classification == Classification::Success {
                self.metrics.record_success(tier, outcome.elapsed, task_hint);
                self.proxy.report_success(&proxy).await;
                self.maybe_cache_session(&domain, &outcome).await;
                return self.finish(
                    Classification::Success,
                    outcome.status,
                    tier,
                    escalation_path,
                    run_started.elapsed(),
                    outcome.content,
                    None,
                    None,
                    None,
                );
            }

            let kind = error_kind_for(&outcome, classification);
            self.metrics.record_failure(tier, &domain, kind, task_hint);
            if proxy != DIRECT_NO_PROXY {
                let severity = match classification {
                    Classification::Fatal | Classification::NeedsManualSolve => FailureSeverity::Hard,
                    _ => FailureSeverity::Soft,
                };
                self.proxy.report_failure(&proxy, severity).await;
            }

            match classification {
                Classification::Success => unreachable!("handled above"),
                Classification::TransientRetry if kind == ErrorKind::RateLimit => {
                    rate_limit_hits_at_tier += 1;
                    if rate_limit_hits_at_tier >= RATE_LIMIT_REPEAT_THRESHOLD {
                        let (_, next) = escalate_after_repeated_rate_limit(tier);
                        self.metrics.record_escalation(task_hint);
                        match next {
                            Some(next_tier) => {
                                tier = next_tier;
                                attempts_at_tier = 0;
                                rate_limit_hits_at_tier = 0;
                            }
                            None => {
                                return self.finish(
                                    Classification::Fatal,
                                    outcome.status,
                                    tier,
                                    escalation_path,
                                    run_started.elapsed(),
                                    Vec::new(),
                                    Some(kind),
                                    Some("exhausted retries at final tier after repeated rate limiting".to_string()),
                                    None,
                                );
                            }
                        }
                    } else {
                        let delay = retry_after_delay(&outcome)
                            .unwrap_or_else(|| Duration::from_millis(rand::thread_rng().gen_range(50..250)));
                        tokio::time::sleep(delay).await;
                    }
                }
                Classification::TransientRetry => {
                    rate_limit_hits_at_tier = 0;
                    attempts_at_tier += 1;
                    if attempts_at_tier >= MAX_ATTEMPTS_PER_TIER {
                        match tier.next() {
                            Some(next) => {
                                tier = next;
                                attempts_at_tier = 0;
                            }
                            None => {
                                return self.finish(
                                    Classification::Fatal,
                                    outcome.status,
                                    tier,
                                    escalation_path,
                                    run_started.elapsed(),
                                    Vec::new(),
                                    Some(kind),
                                    Some("exhausted retries at final tier".to_string()),
                                    None,
                                );
                            }
                        }
                    } else {
                        let jitter_ms = rand::thread_rng().gen_range(50..250);
                        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                    }
                }
                Classification::ChallengeEscalate => {
                    rate_limit_hits_at_tier = 0;
                    self.metrics.record_escalation(task_hint);
                    match next_tier {
                        Some(next) => {
                            tier = next;
                            attempts_at_tier = 0;
                        }
                        None => {
                            return self.finish(
                                Classification::Fatal,
                                outcome.status,
                                tier,
                                escalation_path,
                                run_started.elapsed(),
                                Vec::new(),
                                Some(kind),
                                Some("no further tier to escalate to".to_string()),
                                None,
                            );
                        }
                    }
                }
                Classification::Fatal => {
                    return self.finish(
                        Classification::Fatal,
                        outcome.status,
                        tier,
                        escalation_path,
                        run_started.elapsed(),
                        Vec::new(),
                        Some(kind),
                        None,
                        None,
                    );
                }
                Classification::NeedsManualSolve => {
                    self.metrics.record_captcha_required(task_hint);
                    match self
                        .enqueue_and_wait(&request, &domain, request_id)
                        .await
                    {
                        Ok(Some(entry)) => {
                            self.sessions.put(&domain, entry).await;
                            tier = Tier::T1;
                            attempts_at_tier = 0;
                            rate_limit_hits_at_tier = 0;
                        }
                        Ok(None) => {
                            return self.finish(
                                Classification::Fatal,
                                outcome.status,
                                tier,
                                escalation_path,
                                run_started.elapsed(),
                                Vec::new(),
                                Some(ErrorKind::ManualSolveFailed),
                                Some("manual solve did not produce a usable session".to_string()),
                                None,
                            );
                        }
                        Err((error_kind, message, task_id)) => {
                            return self.finish(
                                Classification::Fatal,
                                outcome.status,
                                tier,
                                escalation_path,
                                run_started.elapsed(),
                                Vec::new(),
                                Some(error_kind),
                                Some(message),
                                task_id,
                            );
                        }
                    }
                }
            }
        }
    }

    /// Enqueues (or joins) a CAPTCHA task for `domain` and waits for it to
    /// reach a terminal state. `Ok(Some(entry))` on a solve, `Ok(None)` if
    /// the queue itself is unreachable, `Err` with the task id otherwise so
    /// the caller can surface it for operator follow-up.
    async fn enqueue_and_wait(
        &self,
        request: &UrlRequest,
        domain: &str,
        request_id: Uuid,
    ) -> Result<Option<SessionEntry>, (ErrorKind, String, Option<Uuid>)> {
        let task_id = match self
            .captcha
            .enqueue(
                request.url.to_string(),
                domain.to_string(),
                DEFAULT_CAPTCHA_PRIORITY,
                request_id,
                self.captcha_ttl,
            )
            .await
        {
            Ok(id) => id,
            Err(err) => {
                return Err((
                    ErrorKind::ManualSolveFailed,
                    format!("failed to enqueue captcha task: {err}"),
                    None,
                ));
            }
        };

        match self.captcha.wait_for_terminal(task_id).await {
            Ok(TerminalOutcome::Solved(result)) => {
                let mut entry = SessionEntry::new(result.cf_clearance, result.user_agent);
                for (name, value) in result.cookies {
                    entry = entry.with_extra_cookie(name, value);
                }
                Ok(Some(entry))
            }
            Ok(TerminalOutcome::Failed(message)) => Err((
                ErrorKind::ManualSolveFailed,
                message.unwrap_or_else(|| "manual solve failed".to_string()),
                Some(task_id),
            )),
            Ok(TerminalOutcome::Expired) => Err((
                ErrorKind::ManualSolveExpired,
                "manual solve task expired before being solved".to_string(),
                Some(task_id),
            )),
            Ok(TerminalOutcome::Unsolvable) => Err((
                ErrorKind::ManualSolveFailed,
                "manual solve task marked unsolvable".to_string(),
                Some(task_id),
            )),
            Err(CaptchaError::NotFound(_)) => Err((
                ErrorKind::ManualSolveFailed,
                "captcha task vanished while waiting".to_string(),
                Some(task_id),
            )),
            Err(err) => Err((ErrorKind::ManualSolveFailed, err.to_string(), Some(task_id))),
        }
    }

    /// Cache a fresh session entry when a successful outcome carries a
    /// `cf_clearance` cookie, mirroring `session_cache.py`'s write-through
    /// behavior on a clean pass.
    async fn maybe_cache_session(&self, domain: &str, outcome: &crate::outcome::AcquisitionOutcome) {
        let Some(set_cookie) = outcome.header("set-cookie") else {
            return;
        };
        let Some(clearance) = extract_cookie_value(set_cookie, "cf_clearance") else {
            return;
        };
        let user_agent = outcome
            .header("x-titan-user-agent")
            .map(str::to_string)
            .unwrap_or_else(|| "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Titan/1.0".to_string());
        self.sessions
            .put(domain, SessionEntry::new(clearance, user_agent))
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        classification: Classification,
        final_status: Option<u16>,
        final_tier: Tier,
        escalation_path: Vec<Tier>,
        total_elapsed: Duration,
        content: Vec<u8>,
        error_kind: Option<ErrorKind>,
        message: Option<String>,
        captcha_task_id: Option<Uuid>,
    ) -> OrchestrationOutcome {
        OrchestrationOutcome {
            classification,
            final_status,
            final_tier,
            escalation_path,
            total_elapsed,
            content,
            error_kind,
            message,
            captcha_task_id,
        }
    }
}

fn error_kind_for(outcome: &crate::outcome::AcquisitionOutcome, classification: Classification) -> ErrorKind {
    if let Some(kind) = outcome.error_kind {
        return kind;
    }
    if classification == Classification::NeedsManualSolve || classification == Classification::ChallengeEscalate {
        match outcome.detected_challenge_tag {
            ChallengeTag::CfInterstitial => return ErrorKind::ChallengeCf,
            ChallengeTag::CfTurnstile => return ErrorKind::ChallengeTurnstile,
            ChallengeTag::HCaptcha => return ErrorKind::ChallengeHCaptcha,
            ChallengeTag::ReCaptcha => return ErrorKind::ChallengeReCaptcha,
            ChallengeTag::WafBlock => return ErrorKind::WafBlock,
            ChallengeTag::RateLimit => return ErrorKind::RateLimit,
            ChallengeTag::None => {}
        }
    }
    match outcome.status {
        Some(status) if status == 429 => ErrorKind::RateLimit,
        Some(status) if (400..500).contains(&status) => ErrorKind::Http4xx,
        Some(status) if (500..600).contains(&status) => ErrorKind::Http5xx,
        _ => ErrorKind::ContentInvalid,
    }
}

fn extract_cookie_value<'a>(set_cookie: &'a str, name: &str) -> Option<&'a str> {
    set_cookie.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix(&format!("{name}="))
    })
}

fn hash_domain(domain: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    domain.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ScriptedOutcome, SimulatedDriver};
    use crate::outcome::AcquisitionOutcome;
    use crate::proxy::RotatorConfig;
    use crate::session::InMemorySessionStore;
    use url::Url;

    fn request(url: &str) -> UrlRequest {
        UrlRequest::new(Url::parse(url).unwrap())
    }

    fn test_orchestrator(drivers: HashMap<Tier, Arc<dyn TierDriver>>) -> Orchestrator {
        Orchestrator::new(
            drivers,
            Arc::new(ProxyRotator::new(vec![], RotatorConfig::default())),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(CaptchaQueue::in_memory()),
            Arc::new(crate::metrics::MetricsRecorder::new()),
            &TitanConfig::default(),
        )
    }

    fn all_tier_drivers(t1: Arc<dyn TierDriver>) -> HashMap<Tier, Arc<dyn TierDriver>> {
        let mut drivers: HashMap<Tier, Arc<dyn TierDriver>> = HashMap::new();
        drivers.insert(Tier::T1, t1);
        for tier in [Tier::T2, Tier::T3, Tier::T4, Tier::T5] {
            drivers.insert(
                tier,
                Arc::new(SimulatedDriver::always(
                    tier,
                    AcquisitionOutcome::success(tier, 200, vec![0u8; 10_000], Duration::ZERO),
                )),
            );
        }
        drivers
    }

    #[tokio::test]
    async fn immediate_success_returns_without_escalating() {
        let t1: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::always(
            Tier::T1,
            AcquisitionOutcome::success(Tier::T1, 200, vec![0u8; 10_000], Duration::ZERO),
        ));
        let orchestrator = test_orchestrator(all_tier_drivers(t1));
        let outcome = orchestrator.acquire(request("https://example.com")).await;
        assert_eq!(outcome.classification, Classification::Success);
        assert_eq!(outcome.escalation_path, vec![Tier::T1]);
    }

    #[tokio::test]
    async fn cf_interstitial_escalates_through_tiers_to_success() {
        let mut cf_outcome = AcquisitionOutcome::success(Tier::T1, 503, vec![0u8; 10], Duration::ZERO);
        cf_outcome.detected_challenge_tag = ChallengeTag::CfInterstitial;
        let t1: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::always(Tier::T1, cf_outcome));
        let orchestrator = test_orchestrator(all_tier_drivers(t1));
        let outcome = orchestrator.acquire(request("https://example.com")).await;
        assert_eq!(outcome.classification, Classification::Success);
        assert_eq!(outcome.final_tier, Tier::T2);
        assert_eq!(outcome.escalation_path, vec![Tier::T1, Tier::T2]);
    }

    #[tokio::test]
    async fn repeated_5xx_retries_then_escalates() {
        let script = vec![
            ScriptedOutcome::new(AcquisitionOutcome::success(Tier::T1, 502, vec![0u8; 10], Duration::ZERO)),
            ScriptedOutcome::new(AcquisitionOutcome::success(Tier::T1, 502, vec![0u8; 10], Duration::ZERO)),
            ScriptedOutcome::new(AcquisitionOutcome::success(Tier::T1, 502, vec![0u8; 10], Duration::ZERO)),
        ];
        let t1: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::new(Tier::T1, script));
        let orchestrator = test_orchestrator(all_tier_drivers(t1));
        let outcome = orchestrator.acquire(request("https://example.com")).await;
        assert_eq!(outcome.classification, Classification::Success);
        assert_eq!(outcome.final_tier, Tier::T2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_rate_limit_escalates_on_second_consecutive_429() {
        let script = vec![
            ScriptedOutcome::new(AcquisitionOutcome::success(Tier::T1, 429, vec![0u8; 10], Duration::ZERO)),
            ScriptedOutcome::new(AcquisitionOutcome::success(Tier::T1, 429, vec![0u8; 10], Duration::ZERO)),
        ];
        let t1: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::new(Tier::T1, script));
        let orchestrator = test_orchestrator(all_tier_drivers(t1));
        let outcome = orchestrator.acquire(request("https://example.com")).await;
        assert_eq!(outcome.classification, Classification::Success);
        assert_eq!(outcome.final_tier, Tier::T2);
        assert_eq!(outcome.escalation_path, vec![Tier::T1, Tier::T1, Tier::T2]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_sleeps_for_retry_after_header_on_first_hit() {
        let rate_limited = AcquisitionOutcome::success(Tier::T1, 429, vec![0u8; 10], Duration::ZERO)
            .with_header("retry-after", "5");
        let script = vec![
            ScriptedOutcome::new(rate_limited),
            ScriptedOutcome::new(AcquisitionOutcome::success(Tier::T1, 200, vec![0u8; 10_000], Duration::ZERO)),
        ];
        let t1: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::new(Tier::T1, script));
        let orchestrator = test_orchestrator(all_tier_drivers(t1));

        let before = tokio::time::Instant::now();
        let outcome = orchestrator.acquire(request("https://example.com")).await;
        assert_eq!(outcome.classification, Classification::Success);
        assert_eq!(outcome.final_tier, Tier::T1);
        assert!(tokio::time::Instant::now() - before >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fatal_4xx_returns_without_retry() {
        let t1: Arc<dyn TierDriver> = Arc::new(SimulatedDriver::always(
            Tier::T1,
            AcquisitionOutcome::success(Tier::T1, 404, vec![0u8; 10], Duration::ZERO),
        ));
        let orchestrator = test_orchestrator(all_tier_drivers(t1));
        let outcome = orchestrator.acquire(request("https://example.com")).await;
        assert_eq!(outcome.classification, Classification::Fatal);
        assert_eq!(outcome.escalation_path, vec![Tier::T1]);
    }

    #[tokio::test]
    async fn turnstile_at_t4_requires_manual_solve_then_resumes_at_t1() {
        // classify()'s Turnstile rule only escalates through T1-T3; T4 and T5
        // both fall through to NeedsManualSolve, so a Turnstile tag reported
        // at T4 never reaches the T5 driver.
        let mut turnstile = AcquisitionOutcome::success(Tier::T4, 403, vec![0u8; 10], Duration::ZERO);
        turnstile.detected_challenge_tag = ChallengeTag::CfTurnstile;

        let mut drivers: HashMap<Tier, Arc<dyn TierDriver>> = HashMap::new();
        drivers.insert(
            Tier::T1,
            Arc::new(SimulatedDriver::always(
                Tier::T1,
                AcquisitionOutcome::success(Tier::T1, 200, vec![0u8; 10_000], Duration::ZERO),
            )),
        );
        for tier in [Tier::T2, Tier::T3] {
            let mut escalate = turnstile.clone();
            escalate.tier = tier;
            drivers.insert(tier, Arc::new(SimulatedDriver::always(tier, escalate)));
        }
        drivers.insert(Tier::T4, Arc::new(SimulatedDriver::always(Tier::T4, turnstile)));

        let sessions = Arc::new(InMemorySessionStore::new());
        let captcha = Arc::new(CaptchaQueue::in_memory());
        let orchestrator = Orchestrator::new(
            drivers,
            Arc::new(ProxyRotator::new(vec![], RotatorConfig::default())),
            sessions,
            captcha.clone(),
            Arc::new(crate::metrics::MetricsRecorder::new()),
            &TitanConfig::default(),
        );

        let req = request("https://needs-human.example").with_forced_tier(Tier::T4);

        let solver = tokio::spawn(async move {
            loop {
                if let Some(task_id) = captcha.claim("operator-1").await.unwrap() {
                    captcha.start(task_id, "operator-1").await.unwrap();
                    captcha
                        .submit(
                            task_id,
                            "operator-1",
                            crate::captcha::SolverResult {
                                cf_clearance: "solved-token".to_string(),
                                user_agent: "Mozilla/5.0 (Titan)".to_string(),
                                cookies: HashMap::new(),
                            },
                        )
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let outcome = orchestrator.acquire(req).await;
        solver.await.unwrap();

        assert_eq!(outcome.classification, Classification::Success);
        assert_eq!(outcome.final_tier, Tier::T1);
        assert!(outcome.escalation_path.contains(&Tier::T4));
        assert_eq!(*outcome.escalation_path.last().unwrap(), Tier::T1);
    }
}
