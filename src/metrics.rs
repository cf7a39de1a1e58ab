//! The Metrics Recorder (C8).
//!
//! Field set is `modules::metrics::MetricsCollector` (global + per-domain
//! accumulators, bounded latency ring, percentile derivation) merged with
//! `original_source/metrics.py`'s `TitanMetrics` (per-tier counts,
//! per-error-kind counts, per-challenge-kind counts, escalations,
//! CAPTCHA-required, cached-session-hit counters) and its
//! `to_prometheus()` text export. Per the "singleton metrics with mutex ->
//! sharded counters" redesign note, the hot counters are striped across
//! `NUM_SHARDS` shards merged on read, rather than the teacher's single
//! `Mutex<MetricsState>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::outcome::ErrorKind;
use crate::tier::Tier;

const NUM_SHARDS: usize = 8;
const GLOBAL_RING_CAPACITY: usize = 10_000;
const PER_TIER_RING_CAPACITY: usize = 5_000;

#[derive(Default)]
struct Shard {
    total: u64,
    success: u64,
    failure: u64,
    escalations: u64,
    captcha_required: u64,
    cached_session_hits: u64,
    per_tier: HashMap<Tier, u64>,
    per_error_kind: HashMap<&'static str, u64>,
    per_domain_failures: HashMap<String, u64>,
    global_ring: Vec<u64>,
    per_tier_ring: HashMap<Tier, Vec<u64>>,
}

/// Shard index derived from a cheap hash of the calling task id so that
/// concurrent writers rarely contend on the same shard's mutex.
fn shard_index(task_discriminant: u64) -> usize {
    (task_discriminant as usize) % NUM_SHARDS
}

/// Point-in-time read of the recorder's counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub escalations: u64,
    pub captcha_required: u64,
    pub cached_session_hits: u64,
    pub per_tier: HashMap<Tier, u64>,
    pub per_error_kind: HashMap<&'static str, u64>,
    pub per_domain_failures: HashMap<String, u64>,
    pub p50_ms: Option<u64>,
    pub p90_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

pub struct MetricsRecorder {
    shards: Vec<Mutex<Shard>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(Shard::default())).collect(),
        }
    }

    fn shard(&self, hint: u64) -> &Mutex<Shard> {
        &self.shards[shard_index(hint)]
    }

    pub fn record_success(&self, tier: Tier, elapsed: Duration, task_hint: u64) {
        let mut shard = self.shard(task_hint).lock().expect("metrics shard poisoned");
        shard.total += 1;
        shard.success += 1;
        *shard.per_tier.entry(tier).or_insert(0) += 1;
        push_bounded(&mut shard.global_ring, elapsed.as_millis() as u64, GLOBAL_RING_CAPACITY);
        let ring = shard.per_tier_ring.entry(tier).or_default();
        push_bounded(ring, elapsed.as_millis() as u64, PER_TIER_RING_CAPACITY);
    }

    pub fn record_failure(&self, tier: Tier, domain: &str, kind: ErrorKind, task_hint: u64) {
        let mut shard = self.shard(task_hint).lock().expect("metrics shard poisoned");
        shard.total += 1;
        shard.failure += 1;
        *shard.per_tier.entry(tier).or_insert(0) += 1;
        *shard.per_error_kind.entry(error_kind_label(kind)).or_insert(0) += 1;
        *shard.per_domain_failures.entry(domain.to_string()).or_insert(0) += 1;
    }

    pub fn record_escalation(&self, task_hint: u64) {
        self.shard(task_hint).lock().expect("metrics shard poisoned").escalations += 1;
    }

    pub fn record_captcha_required(&self, task_hint: u64) {
        self.shard(task_hint)
            .lock()
            .expect("metrics shard poisoned")
            .captcha_required += 1;
    }

    pub fn record_cached_session_hit(&self, task_hint: u64) {
        self.shard(task_hint)
            .lock()
            .expect("metrics shard poisoned")
            .cached_session_hits += 1;
    }

    /// Merge all shards into a single point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut merged = MetricsSnapshot::default();
        let mut global_samples = Vec::new();

        for shard in &self.shards {
            let shard = shard.lock().expect("metrics shard poisoned");
            merged.total += shard.total;
            merged.success += shard.success;
            merged.failure += shard.failure;
            merged.escalations += shard.escalations;
            merged.captcha_required += shard.captcha_required;
            merged.cached_session_hits += shard.cached_session_hits;
            for (tier, count) in &shard.per_tier {
                *merged.per_tier.entry(*tier).or_insert(0) += count;
            }
            for (kind, count) in &shard.per_error_kind {
                *merged.per_error_kind.entry(kind).or_insert(0) += count;
            }
            for (domain, count) in &shard.per_domain_failures {
                *merged.per_domain_failures.entry(domain.clone()).or_insert(0) += count;
            }
            global_samples.extend_from_slice(&shard.global_ring);
        }

        global_samples.sort_unstable();
        merged.p50_ms = percentile(&global_samples, 0.50);
        merged.p90_ms = percentile(&global_samples, 0.90);
        // Matching `metrics.py::_calculate_timing_stats`: p99 is only
        // meaningful with enough samples to avoid a single outlier
        // dominating the tail.
        merged.p99_ms = if global_samples.len() >= 100 {
            percentile(&global_samples, 0.99)
        } else {
            None
        };

        merged
    }

    /// Prometheus text exposition format: `name{label="v"} value` per line,
    /// matching `metrics.py::to_prometheus`'s shape.
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        out.push_str(&format!("titan_requests_total {}\n", snapshot.total));
        out.push_str(&format!("titan_requests_success {}\n", snapshot.success));
        out.push_str(&format!("titan_requests_failure {}\n", snapshot.failure));
        out.push_str(&format!("titan_escalations_total {}\n", snapshot.escalations));
        out.push_str(&format!(
            "titan_captcha_required_total {}\n",
            snapshot.captcha_required
        ));
        out.push_str(&format!(
            "titan_cached_session_hits_total {}\n",
            snapshot.cached_session_hits
        ));
        for (tier, count) in &snapshot.per_tier {
            out.push_str(&format!("titan_requests_by_tier{{tier=\"{tier}\"}} {count}\n"));
        }
        for (kind, count) in &snapshot.per_error_kind {
            out.push_str(&format!("titan_errors_by_kind{{kind=\"{kind}\"}} {count}\n"));
        }
        for (domain, count) in &snapshot.per_domain_failures {
            out.push_str(&format!(
                "titan_failures_by_domain{{domain=\"{domain}\"}} {count}\n"
            ));
        }
        if let Some(p50) = snapshot.p50_ms {
            out.push_str(&format!("titan_latency_ms{{quantile=\"0.5\"}} {p50}\n"));
        }
        if let Some(p90) = snapshot.p90_ms {
            out.push_str(&format!("titan_latency_ms{{quantile=\"0.9\"}} {p90}\n"));
        }
        if let Some(p99) = snapshot.p99_ms {
            out.push_str(&format!("titan_latency_ms{{quantile=\"0.99\"}} {p99}\n"));
        }
        out
    }
}

fn push_bounded(ring: &mut Vec<u64>, value: u64, capacity: usize) {
    if ring.len() >= capacity {
        ring.remove(0);
    }
    ring.push(value);
}

fn percentile(sorted_samples: &[u64], p: f64) -> Option<u64> {
    if sorted_samples.is_empty() {
        return None;
    }
    let index = ((sorted_samples.len() as f64 - 1.0) * p).round() as usize;
    sorted_samples.get(index).copied()
}

fn error_kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::DnsError => "dns_error",
        ErrorKind::ConnectError => "connect_error",
        ErrorKind::TlsError => "tls_error",
        ErrorKind::Timeout => "timeout",
        ErrorKind::Http4xx => "http_4xx",
        ErrorKind::Http5xx => "http_5xx",
        ErrorKind::ChallengeCf => "challenge_cf",
        ErrorKind::ChallengeTurnstile => "challenge_turnstile",
        ErrorKind::ChallengeHCaptcha => "challenge_hcaptcha",
        ErrorKind::ChallengeReCaptcha => "challenge_recaptcha",
        ErrorKind::WafBlock => "waf_block",
        ErrorKind::RateLimit => "rate_limit",
        ErrorKind::ContentInvalid => "content_invalid",
        ErrorKind::DriverCrash => "driver_crash",
        ErrorKind::ManualSolveFailed => "manual_solve_failed",
        ErrorKind::ManualSolveExpired => "manual_solve_expired",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::DeadlineExceeded => "deadline_exceeded",
    }
}

/// Convenience wrapper for sharing one recorder across the orchestrator,
/// swarm engine, and drivers.
pub type SharedMetrics = Arc<MetricsRecorder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure() {
        let metrics = MetricsRecorder::new();
        metrics.record_success(Tier::T1, Duration::from_millis(50), 0);
        metrics.record_failure(Tier::T1, "example.com", ErrorKind::Http4xx, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.failure, 1);
        assert_eq!(snapshot.per_domain_failures.get("example.com"), Some(&1));
    }

    #[test]
    fn merges_across_shards() {
        let metrics = MetricsRecorder::new();
        for hint in 0..16u64 {
            metrics.record_success(Tier::T1, Duration::from_millis(10), hint);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.success, 16);
    }

    #[test]
    fn p99_requires_at_least_100_samples() {
        let metrics = MetricsRecorder::new();
        for i in 0..10 {
            metrics.record_success(Tier::T1, Duration::from_millis(i), i);
        }
        assert!(metrics.snapshot().p99_ms.is_none());
    }

    #[test]
    fn prometheus_export_contains_core_counters() {
        let metrics = MetricsRecorder::new();
        metrics.record_success(Tier::T1, Duration::from_millis(5), 0);
        let text = metrics.render_prometheus();
        assert!(text.contains("titan_requests_total 1"));
        assert!(text.contains("titan_requests_success 1"));
    }
}
