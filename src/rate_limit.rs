use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window in-memory rate limiter (pod local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Per-action write budgets, derived from env.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub post_limit: usize,
    pub post_window: Duration,
    pub comment_limit: usize,
    pub comment_window: Duration,
    pub reaction_limit: usize,
    pub reaction_window: Duration,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        fn dur_env(name: &str, default: u64) -> Duration {
            Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
        }
        Self {
            post_limit: usize_env("RL_POST_LIMIT", 5),
            post_window: dur_env("RL_POST_WINDOW", 300),
            comment_limit: usize_env("RL_COMMENT_LIMIT", 10),
            comment_window: dur_env("RL_COMMENT_WINDOW", 60),
            // reaction toggles are cheap and chatty; budget accordingly
            reaction_limit: usize_env("RL_REACTION_LIMIT", 60),
            reaction_window: dur_env("RL_REACTION_WINDOW", 60),
        }
    }
}

/// High level guard used by handlers; keys are caller uids.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self {
        Self { limiter, cfg }
    }
    pub fn allow_post(&self, uid: &str) -> bool {
        self.limiter.check(&format!("post:{uid}"), self.cfg.post_limit, self.cfg.post_window)
    }
    pub fn allow_comment(&self, uid: &str) -> bool {
        self.limiter
            .check(&format!("comment:{uid}"), self.cfg.comment_limit, self.cfg.comment_window)
    }
    pub fn allow_reaction(&self, uid: &str) -> bool {
        self.limiter
            .check(&format!("reaction:{uid}"), self.cfg.reaction_limit, self.cfg.reaction_window)
    }
}
