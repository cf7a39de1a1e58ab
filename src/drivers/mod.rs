//! The Tier Driver contract (C4) and its concrete implementations.
//!
//! Every driver satisfies the same `Execute`/`Cleanup` contract spec §4.4
//! requires ("the orchestrator must not branch on tier identity except for
//! policy"). [`HttpDriver`] is a real driver, grounded on
//! `challenges::core::reqwest_client::ReqwestChallengeHttpClient` and
//! `cloudscraper::ClientPool`, used for T1. T2-T5's binding shims to
//! third-party browser-automation libraries are explicitly out of scope
//! (spec §1); [`SimulatedDriver`] fulfils the same trait so the
//! orchestrator, swarm engine, and seed-scenario tests can exercise the full
//! ladder end-to-end without a real browser. A production embedder plugs
//! real T2-T5 drivers in behind [`TierDriver`] without touching the
//! orchestrator.

mod http;
mod simulated;

pub use http::HttpDriver;
pub use simulated::{ScriptedOutcome, SimulatedDriver};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::outcome::AcquisitionOutcome;
use crate::request::UrlRequest;
use crate::tier::Tier;

/// Abstract contract every driver satisfies (spec §4.4).
#[async_trait]
pub trait TierDriver: Send + Sync {
    fn tier(&self) -> Tier;

    /// Single-URL fetch. Must respect `request.timeout`, use the supplied
    /// proxy and session headers, and never raise for ordinary failures —
    /// only infrastructure errors may legitimately panic/crash the task,
    /// which the Swarm Engine catches via `JoinSet`.
    async fn execute(
        &self,
        request: &UrlRequest,
        proxy: &str,
        session_headers: &HashMap<String, String>,
    ) -> AcquisitionOutcome;

    /// Release long-lived resources (connection pools, browser processes).
    /// Must be idempotent.
    async fn cleanup(&self);
}
