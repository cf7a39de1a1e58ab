//! The immutable per-attempt URL request and its options.

use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::tier::Tier;

/// A fixed delay, or waiting for a selector to appear, before a driver
/// considers the page settled. Only meaningful to tiers that render JS.
#[derive(Debug, Clone)]
pub enum WaitCondition {
    FixedDelay(Duration),
    SelectorPresent(String),
}

/// Immutable description of one acquisition attempt. Created by the caller
/// and lives for the duration of a single orchestration.
#[derive(Debug, Clone)]
pub struct UrlRequest {
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub forced_tier: Option<Tier>,
    pub timeout: Duration,
    pub wait: Option<WaitCondition>,
}

impl UrlRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            forced_tier: None,
            timeout: Duration::from_secs(30),
            wait: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_forced_tier(mut self, tier: Tier) -> Self {
        self.forced_tier = Some(tier);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_wait(mut self, wait: WaitCondition) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Normalized domain key: host, lowercased, default port stripped.
    pub fn domain(&self) -> String {
        normalize_domain(&self.url)
    }
}

/// Host portion of a URL, lowercased, with the default port for its scheme
/// stripped. Shared by the Session Store and Proxy Rotator for keying.
pub fn normalize_domain(url: &Url) -> String {
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    match (url.port(), url.scheme()) {
        (Some(port), "https") if port == 443 => host,
        (Some(port), "http") if port == 80 => host,
        (Some(port), _) => format!("{host}:{port}"),
        (None, _) => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_default_https_port() {
        let url = Url::parse("https://Example.com:443/path").unwrap();
        assert_eq!(normalize_domain(&url), "example.com");
    }

    #[test]
    fn keeps_non_default_port() {
        let url = Url::parse("https://example.com:8443/path").unwrap();
        assert_eq!(normalize_domain(&url), "example.com:8443");
    }
}
