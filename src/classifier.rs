//! The Failure Classifier (C1): a pure function from outcome to verdict.
//!
//! `classify` is grounded on the rule ordering
//! `challenges::detectors::ChallengeDetector` applies, but flattened into a
//! single deterministic match over a pre-extracted [`ChallengeTag`] rather
//! than running its own Cloudflare sentinel regexes — it never makes a
//! network call or holds state across invocations, matching the
//! pure/stateless contract required of it.
//!
//! [`retry_after_delay`] separately ports
//! `challenges::solvers::rate_limit::RateLimitHandler`'s
//! `retry_after_header`/`delay_from_body` backoff derivation, and
//! [`escalate_after_repeated_rate_limit`] the same handler's repeat-429
//! escalation — both are plain functions the orchestrator calls from its
//! `TransientRetry` arm, since only the orchestrator has the per-tier call
//! history needed to tell a first 429 from a repeat one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::outcome::{AcquisitionOutcome, Classification, ErrorKind};
use crate::tier::Tier;

/// Minimum body length, in bytes, below which a nominally-2xx response is
/// treated as suspicious rather than a genuine page.
pub const MIN_SUCCESS_BODY_BYTES: usize = 64;

/// Maximum retry attempts at a single tier before escalating.
pub const MAX_ATTEMPTS_PER_TIER: u32 = 3;

/// Classify one driver outcome, returning the verdict and — when the verdict
/// is `ChallengeEscalate` — the tier that should be attempted next (`None`
/// when already at the last automated rung, in which case the caller
/// converts to `NeedsManualSolve`).
pub fn classify(outcome: &AcquisitionOutcome, tier: Tier) -> (Classification, Option<Tier>) {
    use crate::outcome::ChallengeTag as T;

    if let Some(kind) = outcome.error_kind {
        return match kind {
            ErrorKind::DnsError => (Classification::Fatal, None),
            ErrorKind::ConnectError | ErrorKind::TlsError => {
                (Classification::TransientRetry, None)
            }
            ErrorKind::Timeout => (Classification::TransientRetry, None),
            ErrorKind::Cancelled => (Classification::Fatal, None),
            ErrorKind::DeadlineExceeded => (Classification::Fatal, None),
            _ => (Classification::Fatal, None),
        };
    }

    let status = match outcome.status {
        Some(s) => s,
        None => return (Classification::TransientRetry, None),
    };

    // Rule 4: Cloudflare interstitial sentinel.
    if matches!(status, 403 | 503) && outcome.detected_challenge_tag == T::CfInterstitial {
        return if tier == Tier::T5 {
            (Classification::NeedsManualSolve, None)
        } else {
            (Classification::ChallengeEscalate, tier.next())
        };
    }

    // Rule 5: Turnstile widget markers.
    if outcome.detected_challenge_tag == T::CfTurnstile {
        return if matches!(tier, Tier::T1 | Tier::T2 | Tier::T3) {
            (Classification::ChallengeEscalate, tier.next())
        } else {
            (Classification::NeedsManualSolve, None)
        };
    }

    if matches!(
        outcome.detected_challenge_tag,
        T::HCaptcha | T::ReCaptcha | T::WafBlock
    ) {
        return if tier == Tier::T5 {
            (Classification::NeedsManualSolve, None)
        } else {
            (Classification::ChallengeEscalate, tier.next())
        };
    }

    // Rule 6: rate limiting.
    if status == 429 || outcome.detected_challenge_tag == T::RateLimit {
        return (Classification::TransientRetry, None);
    }

    // Rule 3 / 9: success, subject to the body-size floor.
    if (200..300).contains(&status) {
        if outcome.content.len() < MIN_SUCCESS_BODY_BYTES {
            return (Classification::ChallengeEscalate, tier.next());
        }
        return (Classification::Success, None);
    }

    // Rule 7: other 4xx.
    if (400..500).contains(&status) {
        return (Classification::Fatal, None);
    }

    // Rule 8: 5xx (non-Cloudflare-challenge, already excluded above).
    if (500..600).contains(&status) {
        return (Classification::TransientRetry, None);
    }

    (Classification::Fatal, None)
}

/// Apply rule 6's "repeat 429 escalates and marks the proxy cooling" clause.
/// The orchestrator calls this instead of a plain retry once it has seen a
/// second consecutive `TransientRetry` caused by a 429/rate limit tag at the
/// same tier — `classify` itself is stateless and cannot see "consecutive".
pub fn escalate_after_repeated_rate_limit(tier: Tier) -> (Classification, Option<Tier>) {
    (Classification::ChallengeEscalate, tier.next())
}

static RATE_LIMIT_DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(\d+)\s*(second|seconds|minute|minutes|hour|hours)"#)
        .case_insensitive(true)
        .build()
        .expect("invalid delay regex")
});

/// Delay indicated by a rate-limited outcome, ported from
/// `RateLimitHandler::retry_after_header`/`delay_from_body`: prefer the
/// `retry-after` header (a delay-seconds integer or an HTTP-date in RFC 2822
/// or RFC 3339 form), falling back to a body phrase like "wait 10 minutes".
/// Returns `None` when neither source yields a usable delay, in which case
/// the caller falls back to its own jitter.
pub fn retry_after_delay(outcome: &AcquisitionOutcome) -> Option<Duration> {
    if let Some(raw) = outcome.header("retry-after") {
        let raw = raw.trim();
        if let Ok(seconds) = raw.parse::<f64>()
            && seconds.is_finite()
            && seconds >= 0.0
        {
            return Some(Duration::from_secs_f64(seconds));
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(raw).or_else(|_| DateTime::parse_from_rfc3339(raw))
            && let Ok(duration) = (date.with_timezone(&Utc) - Utc::now()).to_std()
        {
            return Some(duration);
        }
    }

    let body = String::from_utf8_lossy(&outcome.content);
    let caps = RATE_LIMIT_DELAY_RE.captures(&body)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2)?.as_str().to_lowercase().as_str() {
        "second" | "seconds" => 1,
        "minute" | "minutes" => 60,
        "hour" | "hours" => 3600,
        _ => 1,
    };
    Some(Duration::from_secs(amount * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ChallengeTag;
    use std::time::Duration;

    fn ok(tier: Tier, status: u16, body_len: usize) -> AcquisitionOutcome {
        AcquisitionOutcome::success(tier, status, vec![0u8; body_len], Duration::from_millis(10))
    }

    #[test]
    fn classify_is_deterministic() {
        let outcome = ok(Tier::T1, 200, 10_000);
        assert_eq!(classify(&outcome, Tier::T1), classify(&outcome, Tier::T1));
    }

    #[test]
    fn plain_200_is_success() {
        let outcome = ok(Tier::T1, 200, 10_000);
        assert_eq!(
            classify(&outcome, Tier::T1),
            (Classification::Success, None)
        );
    }

    #[test]
    fn zero_byte_200_escalates() {
        let outcome = ok(Tier::T1, 200, 0);
        assert_eq!(
            classify(&outcome, Tier::T1),
            (Classification::ChallengeEscalate, Some(Tier::T2))
        );
    }

    #[test]
    fn cf_interstitial_escalates_until_t5() {
        let mut outcome = ok(Tier::T1, 403, 500);
        outcome.detected_challenge_tag = ChallengeTag::CfInterstitial;
        assert_eq!(
            classify(&outcome, Tier::T1),
            (Classification::ChallengeEscalate, Some(Tier::T2))
        );

        let mut at_t5 = ok(Tier::T5, 403, 500);
        at_t5.detected_challenge_tag = ChallengeTag::CfInterstitial;
        assert_eq!(
            classify(&at_t5, Tier::T5),
            (Classification::NeedsManualSolve, None)
        );
    }

    #[test]
    fn turnstile_needs_manual_from_t4() {
        let mut outcome = ok(Tier::T4, 403, 500);
        outcome.detected_challenge_tag = ChallengeTag::CfTurnstile;
        assert_eq!(
            classify(&outcome, Tier::T4),
            (Classification::NeedsManualSolve, None)
        );
    }

    #[test]
    fn rate_limit_is_transient() {
        let outcome = ok(Tier::T1, 429, 10);
        assert_eq!(
            classify(&outcome, Tier::T1),
            (Classification::TransientRetry, None)
        );
    }

    #[test]
    fn other_4xx_is_fatal() {
        let outcome = ok(Tier::T1, 404, 10);
        assert_eq!(classify(&outcome, Tier::T1), (Classification::Fatal, None));
    }

    #[test]
    fn non_cf_5xx_is_transient() {
        let outcome = ok(Tier::T1, 502, 10);
        assert_eq!(
            classify(&outcome, Tier::T1),
            (Classification::TransientRetry, None)
        );
    }

    #[test]
    fn dns_error_is_fatal_without_escalation() {
        let outcome = AcquisitionOutcome::error(Tier::T1, ErrorKind::DnsError, Duration::ZERO);
        assert_eq!(classify(&outcome, Tier::T1), (Classification::Fatal, None));
    }

    #[test]
    fn connect_error_is_transient() {
        let outcome = AcquisitionOutcome::error(Tier::T1, ErrorKind::ConnectError, Duration::ZERO);
        assert_eq!(
            classify(&outcome, Tier::T1),
            (Classification::TransientRetry, None)
        );
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let outcome = ok(Tier::T1, 429, 10).with_header("retry-after", "120");
        assert_eq!(retry_after_delay(&outcome), Some(Duration::from_secs(120)));
    }

    #[test]
    fn retry_after_falls_back_to_body_phrase() {
        let mut outcome = ok(Tier::T1, 429, 0);
        outcome.content = b"Please wait 10 minutes before retrying".to_vec();
        assert_eq!(retry_after_delay(&outcome), Some(Duration::from_secs(600)));
    }

    #[test]
    fn retry_after_absent_returns_none() {
        let outcome = ok(Tier::T1, 429, 10);
        assert_eq!(retry_after_delay(&outcome), None);
    }

    #[test]
    fn escalate_after_repeated_rate_limit_advances_tier() {
        assert_eq!(
            escalate_after_repeated_rate_limit(Tier::T1),
            (Classification::ChallengeEscalate, Some(Tier::T2))
        );
        assert_eq!(
            escalate_after_repeated_rate_limit(Tier::T5),
            (Classification::ChallengeEscalate, None)
        );
    }
}
