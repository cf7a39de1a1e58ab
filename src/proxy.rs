//! The Proxy Rotator (C2).
//!
//! Generalizes `modules::proxy::ProxyManager`'s entry/health bookkeeping:
//! wrapped in a `tokio::sync::Mutex` (selection may be called from many
//! concurrently-running orchestrations rather than the teacher's
//! single-owner `&mut self`), the ban-counter scheme collapsed into the
//! three explicit states spec'd for this engine, and a sticky-session
//! binding table added — a capability `ProxyManager` does not have at all.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    StickySession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHealth {
    Healthy,
    Cooling,
    Banned,
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    url: String,
    health: ProxyHealth,
    consecutive_failures: u32,
    cooling_until: Option<Instant>,
    banned_until: Option<Instant>,
}

impl ProxyEntry {
    fn new(url: String) -> Self {
        Self {
            url,
            health: ProxyHealth::Healthy,
            consecutive_failures: 0,
            cooling_until: None,
            banned_until: None,
        }
    }

    fn refresh(&mut self, now: Instant) {
        if self.health == ProxyHealth::Cooling {
            if let Some(until) = self.cooling_until
                && now >= until
            {
                self.health = ProxyHealth::Healthy;
                self.cooling_until = None;
                self.consecutive_failures = 0;
            }
        }
        if self.health == ProxyHealth::Banned {
            if let Some(until) = self.banned_until
                && now >= until
            {
                self.health = ProxyHealth::Healthy;
                self.banned_until = None;
                self.consecutive_failures = 0;
            }
        }
    }

    fn is_selectable(&self) -> bool {
        self.health != ProxyHealth::Banned
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RotatorConfig {
    pub strategy: RotationStrategy,
    pub cooling_after_failures: u32,
    pub cooldown: Duration,
    pub ban_duration: Duration,
    pub sticky_ttl: Duration,
    pub allow_direct_fallback: bool,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::RoundRobin,
            cooling_after_failures: 3,
            cooldown: Duration::from_secs(60),
            ban_duration: Duration::from_secs(900),
            sticky_ttl: Duration::from_secs(600),
            allow_direct_fallback: true,
        }
    }
}

/// Outcome of a failed request, used to decide how hard to penalize a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    /// 429 / 5xx: soft failure, may eventually cool the proxy down.
    Soft,
    /// 403-with-challenge / explicit ban signal: hard failure, bans at once.
    Hard,
}

struct StickyBinding {
    proxy_url: String,
    bound_until: Instant,
}

/// No-proxy sentinel returned when every proxy is banned and direct fallback
/// is permitted.
pub const DIRECT_NO_PROXY: &str = "direct://no-proxy";

pub struct ProxyRotator {
    inner: Mutex<Inner>,
}

struct Inner {
    config: RotatorConfig,
    entries: Vec<ProxyEntry>,
    next_round_robin: usize,
    sticky: HashMap<String, StickyBinding>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no proxy available and direct fallback is disabled")]
    NoProxyAvailable,
}

impl ProxyRotator {
    pub fn new(proxies: Vec<String>, config: RotatorConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                entries: proxies.into_iter().map(ProxyEntry::new).collect(),
                next_round_robin: 0,
                sticky: HashMap::new(),
            }),
        }
    }

    /// Select a proxy for `session_id` under the rotator's configured
    /// strategy. Never returns a banned proxy; returns the direct/no-proxy
    /// sentinel only if fallback is permitted and no healthy/cooling
    /// candidate remains.
    pub async fn select(&self, session_id: &str) -> Result<String, ProxyError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        for entry in inner.entries.iter_mut() {
            entry.refresh(now);
        }
        inner.evict_stale_sticky_bindings(now);

        if inner.config.strategy == RotationStrategy::StickySession {
            if let Some(binding) = inner.sticky.get(session_id) {
                let still_selectable = inner
                    .entries
                    .iter()
                    .find(|e| e.url == binding.proxy_url)
                    .map(|e| e.is_selectable())
                    .unwrap_or(false);
                if still_selectable && now < binding.bound_until {
                    return Ok(binding.proxy_url.clone());
                }
                // Bound proxy became banned or the binding expired: re-key.
                inner.sticky.remove(session_id);
            }
        }

        let chosen = inner.pick(now)?;

        if inner.config.strategy == RotationStrategy::StickySession && chosen != DIRECT_NO_PROXY {
            inner.sticky.insert(
                session_id.to_string(),
                StickyBinding {
                    proxy_url: chosen.clone(),
                    bound_until: now + inner.config.sticky_ttl,
                },
            );
        }

        Ok(chosen)
    }

    pub async fn report_failure(&self, proxy_url: &str, severity: FailureSeverity) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let cooling_after = inner.config.cooling_after_failures;
        let cooldown = inner.config.cooldown;
        let ban_duration = inner.config.ban_duration;
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.url == proxy_url) {
            entry.consecutive_failures += 1;
            match severity {
                FailureSeverity::Hard => {
                    entry.health = ProxyHealth::Banned;
                    entry.banned_until = Some(now + ban_duration);
                }
                FailureSeverity::Soft if entry.health == ProxyHealth::Healthy => {
                    if entry.consecutive_failures >= cooling_after {
                        entry.health = ProxyHealth::Cooling;
                        entry.cooling_until = Some(now + cooldown);
                    }
                }
                FailureSeverity::Soft => {}
            }
        }
    }

    pub async fn report_success(&self, proxy_url: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.url == proxy_url) {
            entry.consecutive_failures = 0;
        }
    }

    pub async fn health_of(&self, proxy_url: &str) -> Option<ProxyHealth> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .find(|e| e.url == proxy_url)
            .map(|e| e.health)
    }
}

impl Inner {
    fn evict_stale_sticky_bindings(&mut self, now: Instant) {
        self.sticky.retain(|_, binding| now < binding.bound_until);
    }

    fn pick(&mut self, now: Instant) -> Result<String, ProxyError> {
        let selectable: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_selectable())
            .map(|(i, _)| i)
            .collect();

        let healthy: Vec<usize> = selectable
            .iter()
            .copied()
            .filter(|&i| self.entries[i].health == ProxyHealth::Healthy)
            .collect();

        let candidates = if !healthy.is_empty() {
            healthy
        } else {
            selectable
        };

        if candidates.is_empty() {
            return if self.config.allow_direct_fallback {
                Ok(DIRECT_NO_PROXY.to_string())
            } else {
                Err(ProxyError::NoProxyAvailable)
            };
        }

        let chosen_index = match self.config.strategy {
            RotationStrategy::Random => *candidates
                .choose(&mut rand::thread_rng())
                .expect("candidates is non-empty"),
            RotationStrategy::RoundRobin | RotationStrategy::StickySession => {
                let pos = self.next_round_robin % candidates.len();
                self.next_round_robin = self.next_round_robin.wrapping_add(1);
                candidates[pos]
            }
        };

        let _ = now;
        Ok(self.entries[chosen_index].url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotator(strategy: RotationStrategy) -> ProxyRotator {
        ProxyRotator::new(
            vec!["http://p1".into(), "http://p2".into()],
            RotatorConfig {
                strategy,
                cooling_after_failures: 2,
                cooldown: Duration::from_millis(10),
                ban_duration: Duration::from_secs(3600),
                sticky_ttl: Duration::from_millis(50),
                allow_direct_fallback: true,
            },
        )
    }

    #[tokio::test]
    async fn never_selects_banned_proxy() {
        let rotator = rotator(RotationStrategy::RoundRobin);
        rotator
            .report_failure("http://p1", FailureSeverity::Hard)
            .await;
        for _ in 0..10 {
            let chosen = rotator.select("s1").await.unwrap();
            assert_ne!(chosen, "http://p1");
        }
    }

    #[tokio::test]
    async fn sticky_session_binds_to_same_proxy() {
        let rotator = rotator(RotationStrategy::StickySession);
        let first = rotator.select("session-a").await.unwrap();
        for _ in 0..5 {
            assert_eq!(rotator.select("session-a").await.unwrap(), first);
        }
    }

    #[tokio::test]
    async fn sticky_binding_rekeys_when_proxy_banned() {
        let rotator = rotator(RotationStrategy::StickySession);
        let first = rotator.select("session-a").await.unwrap();
        rotator
            .report_failure(&first, FailureSeverity::Hard)
            .await;
        let second = rotator.select("session-a").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn direct_fallback_when_all_banned() {
        let rotator = rotator(RotationStrategy::RoundRobin);
        rotator
            .report_failure("http://p1", FailureSeverity::Hard)
            .await;
        rotator
            .report_failure("http://p2", FailureSeverity::Hard)
            .await;
        assert_eq!(rotator.select("s1").await.unwrap(), DIRECT_NO_PROXY);
    }

    #[tokio::test]
    async fn no_fallback_errors_when_exhausted() {
        let rotator = ProxyRotator::new(
            vec!["http://p1".into()],
            RotatorConfig {
                allow_direct_fallback: false,
                ..RotatorConfig::default()
            },
        );
        rotator
            .report_failure("http://p1", FailureSeverity::Hard)
            .await;
        assert!(matches!(
            rotator.select("s1").await,
            Err(ProxyError::NoProxyAvailable)
        ));
    }

    #[tokio::test]
    async fn soft_failures_cool_then_recover() {
        let rotator = rotator(RotationStrategy::RoundRobin);
        rotator
            .report_failure("http://p1", FailureSeverity::Soft)
            .await;
        rotator
            .report_failure("http://p1", FailureSeverity::Soft)
            .await;
        assert_eq!(
            rotator.health_of("http://p1").await,
            Some(ProxyHealth::Cooling)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = rotator.select("s1").await;
        assert_eq!(
            rotator.health_of("http://p1").await,
            Some(ProxyHealth::Healthy)
        );
    }
}
