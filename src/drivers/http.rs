//! `HttpDriver`: the real T1 tier driver.
//!
//! Grounded on `challenges::core::reqwest_client::ReqwestChallengeHttpClient`
//! for the transport and `cloudscraper::ClientPool` for the one-client-per-proxy
//! caching strategy (a `tokio::sync::Mutex<HashMap<..>>` of `reqwest::Client`,
//! matching the teacher's keying scheme). Challenge-tag extraction reuses
//! `challenges::detectors::ChallengeDetector`'s Cloudflare sentinel regexes;
//! per spec §4.4, T1 never executes JS, so a detected challenge is reported
//! as a tag on the outcome rather than solved in-tier.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use http::{HeaderMap, Method};
use reqwest::Client;
use tokio::sync::Mutex;

use super::TierDriver;
use crate::challenges::core::ChallengeResponse;
use crate::challenges::detectors::{ChallengeDetector, ChallengeType};
use crate::challenges::user_agents::{get_user_agent_profile, UserAgentOptions};
use crate::outcome::{AcquisitionOutcome, ChallengeTag, ErrorKind};
use crate::request::UrlRequest;
use crate::tier::Tier;

/// One pooled client bound to a proxy, plus the fingerprint it was issued —
/// the driver's rotatable JA3/JA4-adjacent pool (spec §4.4): each proxy gets
/// one fingerprint for the lifetime of the client so clearance cookies stay
/// bound to a consistent UA/header set rather than drifting per request.
#[derive(Clone)]
struct PooledClient {
    client: Client,
    user_agent: String,
    extra_headers: HashMap<String, String>,
}

/// Real HTTP-impersonation driver for T1.
pub struct HttpDriver {
    clients: Mutex<HashMap<String, PooledClient>>,
    detector: Mutex<ChallengeDetector>,
    default_user_agent: String,
}

impl HttpDriver {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            detector: Mutex::new(ChallengeDetector::new()),
            default_user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Titan/1.0".to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.default_user_agent = user_agent.into();
        self
    }

    async fn client_for(&self, proxy: &str) -> Result<PooledClient, reqwest::Error> {
        let mut clients = self.clients.lock().await;
        if let Some(pooled) = clients.get(proxy) {
            return Ok(pooled.clone());
        }

        let mut builder = Client::builder().cookie_store(true);
        if proxy != crate::proxy::DIRECT_NO_PROXY {
            if let Ok(proxy_config) = reqwest::Proxy::all(proxy) {
                builder = builder.proxy(proxy_config);
            }
        }
        let client = builder.build()?;

        // The fingerprint pool lives in `browsers.json`, which is only
        // present in a checkout that ships it alongside the crate; fall
        // back to the fixed default fingerprint when it is absent.
        let (user_agent, extra_headers) = match get_user_agent_profile(UserAgentOptions::default()) {
            Ok(profile) => {
                let ua = profile
                    .headers
                    .get("User-Agent")
                    .cloned()
                    .unwrap_or_else(|| self.default_user_agent.clone());
                (ua, profile.headers)
            }
            Err(err) => {
                log::debug!("fingerprint pool unavailable, using default user-agent: {err}");
                (self.default_user_agent.clone(), HashMap::new())
            }
        };

        let pooled = PooledClient {
            client,
            user_agent,
            extra_headers,
        };
        clients.insert(proxy.to_string(), pooled.clone());
        Ok(pooled)
    }
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TierDriver for HttpDriver {
    fn tier(&self) -> Tier {
        Tier::T1
    }

    async fn execute(
        &self,
        request: &UrlRequest,
        proxy: &str,
        session_headers: &HashMap<String, String>,
    ) -> AcquisitionOutcome {
        let started = Instant::now();

        let client = match self.client_for(proxy).await {
            Ok(client) => client,
            Err(_) => {
                return AcquisitionOutcome::error(Tier::T1, ErrorKind::ConnectError, started.elapsed())
                    .with_proxy(proxy);
            }
        };

        // Merge precedence, lowest to highest: pool fingerprint, cached
        // session (clearance is UA-bound, so it overrides the pool), then
        // caller-supplied request headers.
        let mut merged: HashMap<String, String> = client.extra_headers.clone();
        merged.insert("User-Agent".to_string(), client.user_agent.clone());
        for (name, value) in session_headers.iter().chain(request.headers.iter()) {
            merged.insert(name.clone(), value.clone());
        }

        let mut builder = client.client.get(request.url.clone()).timeout(request.timeout);
        for (name, value) in &merged {
            builder = builder.header(name, value);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                let kind = classify_transport_error(&err);
                return AcquisitionOutcome::error(Tier::T1, kind, started.elapsed()).with_proxy(proxy);
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => {
                let kind = classify_transport_error(&err);
                return AcquisitionOutcome::error(Tier::T1, kind, started.elapsed()).with_proxy(proxy);
            }
        };

        let tag = self.extract_challenge_tag(&request.url, status, &headers, &body).await;

        let mut outcome = AcquisitionOutcome::success(Tier::T1, status, body, started.elapsed())
            .with_proxy(proxy)
            .with_challenge_tag(tag);
        outcome.ok = (200..300).contains(&status) && tag == ChallengeTag::None;
        if let Some(content_type) = content_type {
            outcome = outcome.with_content_type(content_type);
        }
        for (name, value) in headers.iter() {
            if let Ok(value_str) = value.to_str() {
                outcome = outcome.with_header(name.as_str(), value_str);
            }
        }
        outcome
    }

    async fn cleanup(&self) {
        self.clients.lock().await.clear();
    }
}

impl HttpDriver {
    async fn extract_challenge_tag(
        &self,
        url: &url::Url,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
    ) -> ChallengeTag {
        if !matches!(status, 403 | 429 | 503) {
            return ChallengeTag::None;
        }
        let body_str = String::from_utf8_lossy(body);
        let method = Method::GET;
        let response = ChallengeResponse {
            url,
            status,
            headers,
            body: &body_str,
            request_method: &method,
        };

        let mut detector = self.detector.lock().await;
        match detector.detect(&response) {
            Some(detection) => match detection.challenge_type {
                ChallengeType::Turnstile => ChallengeTag::CfTurnstile,
                ChallengeType::RateLimit => ChallengeTag::RateLimit,
                ChallengeType::AccessDenied => ChallengeTag::WafBlock,
                ChallengeType::JavaScriptV1
                | ChallengeType::JavaScriptV2
                | ChallengeType::ManagedV3
                | ChallengeType::BotManagement
                | ChallengeType::Unknown => ChallengeTag::CfInterstitial,
            },
            None => ChallengeTag::None,
        }
    }
}

fn classify_transport_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::ConnectError
    } else {
        ErrorKind::ConnectError
    }
}
