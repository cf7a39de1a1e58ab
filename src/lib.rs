//! # titan
//!
//! A tiered Cloudflare-acquisition engine: escalate a request through
//! cheap-to-expensive tiers (plain HTTP impersonation up through a headless,
//! human-assisted browser), track proxy and session health across requests,
//! and fall through to an operator-facing CAPTCHA queue when nothing
//! automated clears the challenge.
//!
//! ## Modules
//!
//! - [`tier`] — the `T1..T5` escalation ladder and its capabilities.
//! - [`request`]/[`outcome`] — the unit of work in and the driver result out.
//! - [`classifier`] — the single source of truth for how an outcome maps to
//!   retry/escalate/manual-solve/fatal.
//! - [`drivers`] — the `TierDriver` trait, the real T1 `HttpDriver`, and the
//!   scriptable `SimulatedDriver` used to exercise T2-T5 and the orchestrator
//!   in tests without a browser.
//! - [`orchestrator`] — the per-request tier-escalation control loop.
//! - [`swarm`] — bounded-concurrency fan-out of many requests through one
//!   driver.
//! - [`proxy`] — proxy selection, health tracking, and sticky-session binding.
//! - [`session`] — the `cf_clearance` session cache.
//! - [`captcha`] — the operator-facing CAPTCHA task queue.
//! - [`metrics`] — sharded counters and a Prometheus exposition format.
//! - [`config`] — the closed TOML configuration schema.
//! - [`api`] — request/response boundary types for an embedding service.
//! - [`error`] — the crate-level error type for setup/config failures.
//!
//! Cloudflare challenge *detection* (not automated solving) is retained from
//! the library this crate grew out of, under [`challenges`].

pub mod api;
pub mod captcha;
pub mod challenges;
pub mod classifier;
pub mod config;
pub mod drivers;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod outcome;
pub mod proxy;
pub mod request;
pub mod session;
pub mod swarm;
pub mod tier;

pub use crate::captcha::{
    CaptchaError,
    CaptchaQueue,
    CaptchaStatus,
    CaptchaTask,
    SolverResult,
    TerminalOutcome,
};

pub use crate::challenges::core::{
    ChallengeExecutionError,
    ChallengeHttpClient,
    ChallengeHttpClientError,
    ChallengeHttpResponse,
    ChallengeResponse,
    ChallengeSubmission,
    OriginalRequest,
    ReqwestChallengeHttpClient,
    execute_challenge_submission,
};

pub use crate::challenges::detectors::{
    ChallengeDetection,
    ChallengeDetector,
    ChallengeType,
    ResponseStrategy,
};

pub use crate::challenges::user_agents::{
    UserAgentError,
    UserAgentOptions,
    UserAgentProfile,
    get_user_agent_profile,
};

pub use crate::classifier::{classify, MAX_ATTEMPTS_PER_TIER, MIN_SUCCESS_BODY_BYTES};
pub use crate::config::{ConfigError, TitanConfig};
pub use crate::drivers::{HttpDriver, ScriptedOutcome, SimulatedDriver, TierDriver};
pub use crate::error::{TitanError, TitanResult};
pub use crate::metrics::{MetricsRecorder, MetricsSnapshot, SharedMetrics};
pub use crate::orchestrator::Orchestrator;
pub use crate::outcome::{AcquisitionOutcome, ChallengeTag, Classification, ErrorKind, OrchestrationOutcome};
pub use crate::proxy::{FailureSeverity, ProxyError, ProxyHealth, ProxyRotator, RotationStrategy, RotatorConfig, DIRECT_NO_PROXY};
pub use crate::request::{normalize_domain, UrlRequest, WaitCondition};
pub use crate::session::{inject, InMemorySessionStore, SessionEntry, SessionStore};
pub use crate::swarm::{ProgressCallback, SwarmCancellation, SwarmEngine, SwarmStats};
pub use crate::tier::{Tier, TierCapabilities};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
