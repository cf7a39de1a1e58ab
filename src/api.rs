//! External interface boundary types (§6). Titan does not implement an HTTP
//! server, router, or database migration — these types exist so an embedding
//! service gets a ready-made, testable contract at the edge.
//!
//! Mirrors `original_source/tests/api/test_scraper.py` and
//! `.../test_captcha.py`'s request/response shapes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::captcha::CaptchaStatus;
use crate::tier::Tier;

/// Acquisition strategy an inbound request asks for. `Auto` lets the
/// orchestrator start at T1 and escalate as needed; the others pin a
/// starting tier, mirroring spec.md §6's `strategy` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStrategy {
    Auto,
    Request,
    Browser,
    Stealth,
}

impl ScrapeStrategy {
    pub fn starting_tier(self) -> Option<Tier> {
        match self {
            ScrapeStrategy::Auto => None,
            ScrapeStrategy::Request => Some(Tier::T1),
            ScrapeStrategy::Browser => Some(Tier::T2),
            ScrapeStrategy::Stealth => Some(Tier::T4),
        }
    }
}

/// Per-request options an inbound API would accept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeOptions {
    pub proxy_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub block_images: bool,
    pub wait_selector: Option<String>,
    pub wait_timeout_secs: Option<u64>,
    pub forced_tier: Option<Tier>,
    pub timeout_secs: Option<u64>,
}

/// The full inbound request a front-end HTTP handler would deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub url: String,
    #[serde(default)]
    pub strategy: ScrapeStrategy,
    #[serde(default)]
    pub options: ScrapeOptions,
}

impl Default for ScrapeStrategy {
    fn default() -> Self {
        ScrapeStrategy::Auto
    }
}

impl ScrapeOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Opaque identifier for an asynchronously-processed scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Status an embedding job runner would report for a [`JobId`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running { current_tier: Tier },
    Succeeded { status: Option<u16> },
    NeedsManualSolve { captcha_task_id: Uuid },
    Failed { message: String },
}

/// CAPTCHA resolver API boundary types (`original_source/tests/api/test_captcha.py`).
pub mod captcha {
    use super::*;

    /// Operator-facing read model for one queued task. Does not expose the
    /// queue's internal `PendingKey`/heap bookkeeping.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CaptchaTaskView {
        pub id: Uuid,
        pub url: String,
        pub domain: String,
        pub status: CaptchaStatus,
        pub priority: i32,
        pub assigned_to: Option<String>,
        pub attempts: u32,
        pub preview_path: Option<String>,
    }

    impl From<&crate::captcha::CaptchaTask> for CaptchaTaskView {
        fn from(task: &crate::captcha::CaptchaTask) -> Self {
            Self {
                id: task.id,
                url: task.url.clone(),
                domain: task.domain.clone(),
                status: task.status,
                priority: task.priority,
                assigned_to: task.assigned_to.clone(),
                attempts: task.attempts,
                preview_path: task.preview_path.clone(),
            }
        }
    }

    /// Body an operator UI would submit to resolve a claimed task.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SolveRequest {
        pub operator: String,
        pub cf_clearance: String,
        pub user_agent: String,
        #[serde(default)]
        pub cookies: HashMap<String, String>,
        pub notes: Option<String>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_maps_to_expected_starting_tier() {
        assert_eq!(ScrapeStrategy::Request.starting_tier(), Some(Tier::T1));
        assert_eq!(ScrapeStrategy::Browser.starting_tier(), Some(Tier::T2));
        assert_eq!(ScrapeStrategy::Stealth.starting_tier(), Some(Tier::T4));
        assert_eq!(ScrapeStrategy::Auto.starting_tier(), None);
    }

    #[test]
    fn scrape_request_deserializes_with_defaulted_options() {
        let json = r#"{"url": "https://example.com"}"#;
        let request: ScrapeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.strategy, ScrapeStrategy::Auto);
        assert!(request.options.headers.is_empty());
    }

    #[test]
    fn captcha_task_view_omits_internal_bookkeeping() {
        let task = crate::captcha::CaptchaTask {
            id: Uuid::new_v4(),
            url: "https://example.com".to_string(),
            domain: "example.com".to_string(),
            status: CaptchaStatus::Pending,
            priority: 5,
            assigned_to: None,
            created_at: chrono::Utc::now(),
            assigned_at: None,
            solved_at: None,
            expires_at: chrono::Utc::now(),
            attempts: 0,
            solver_result: None,
            last_error: None,
            proxy_used: None,
            originating_request_id: Uuid::new_v4(),
            preview_path: None,
            solver_notes: None,
            metadata: serde_json::json!({}),
        };
        let view = captcha::CaptchaTaskView::from(&task);
        assert_eq!(view.id, task.id);
        assert_eq!(view.status, CaptchaStatus::Pending);
    }
}
