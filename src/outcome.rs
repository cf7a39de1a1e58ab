//! The result of a single Tier Driver invocation, and its classification.

use std::collections::HashMap;
use std::time::Duration;

use crate::tier::Tier;

/// Challenge markers a driver may detect in a response. Extraction (regex on
/// headers/body) is the driver's job, grounded on the same sentinel patterns
/// `challenges::detectors` uses for Cloudflare; the classifier only ever
/// consumes this tag, never raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeTag {
    None,
    CfInterstitial,
    CfTurnstile,
    HCaptcha,
    ReCaptcha,
    RateLimit,
    WafBlock,
}

/// Error taxonomy from spec §7. Every path that would otherwise be an
/// exception becomes one of these tags on an outcome instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DnsError,
    ConnectError,
    TlsError,
    Timeout,
    Http4xx,
    Http5xx,
    ChallengeCf,
    ChallengeTurnstile,
    ChallengeHCaptcha,
    ChallengeReCaptcha,
    WafBlock,
    RateLimit,
    ContentInvalid,
    DriverCrash,
    ManualSolveFailed,
    ManualSolveExpired,
    Cancelled,
    DeadlineExceeded,
}

/// Result of one [`crate::drivers::TierDriver::execute`] call.
#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    pub ok: bool,
    pub status: Option<u16>,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub elapsed: Duration,
    pub detected_challenge_tag: ChallengeTag,
    pub error_kind: Option<ErrorKind>,
    pub tier: Tier,
    pub proxy: Option<String>,
    pub session_id: Option<String>,
    /// Headers extracted for classification purposes (`retry-after`,
    /// `cf-ray`, set-cookie, ...), lowercased keys.
    pub response_headers: HashMap<String, String>,
}

impl AcquisitionOutcome {
    pub fn success(tier: Tier, status: u16, content: Vec<u8>, elapsed: Duration) -> Self {
        Self {
            ok: true,
            status: Some(status),
            content,
            content_type: None,
            elapsed,
            detected_challenge_tag: ChallengeTag::None,
            error_kind: None,
            tier,
            proxy: None,
            session_id: None,
            response_headers: HashMap::new(),
        }
    }

    pub fn error(tier: Tier, kind: ErrorKind, elapsed: Duration) -> Self {
        Self {
            ok: false,
            status: None,
            content: Vec::new(),
            content_type: None,
            elapsed,
            detected_challenge_tag: ChallengeTag::None,
            error_kind: Some(kind),
            tier,
            proxy: None,
            session_id: None,
            response_headers: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_challenge_tag(mut self, tag: ChallengeTag) -> Self {
        self.detected_challenge_tag = tag;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }
}

/// Verdict produced by the Failure Classifier for one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    TransientRetry,
    ChallengeEscalate,
    Fatal,
    NeedsManualSolve,
}

/// The final, per-URL verdict returned by the Tier Orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub classification: Classification,
    pub final_status: Option<u16>,
    pub final_tier: Tier,
    pub escalation_path: Vec<Tier>,
    pub total_elapsed: Duration,
    pub content: Vec<u8>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub captcha_task_id: Option<uuid::Uuid>,
}
