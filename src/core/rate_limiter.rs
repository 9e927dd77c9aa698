//! Per-client hourly rate limiting for the chat endpoint.
//!
//! One keyed governor limiter holds a GCRA state per client key
//! (authenticated subject or forwarded IP). Keys are caller-controlled, so
//! states that have fully replenished are swept out periodically.

use governor::{DefaultKeyedRateLimiter, Quota};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::error::AppError;

/// Message the web client shows when the limit is hit.
pub const RATE_LIMIT_MESSAGE: &str = "Too many request from this IP in 1 hour";

/// How often idle client states are dropped.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Rate limiter for managing per-client request limits.
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Option<Arc<DefaultKeyedRateLimiter<String>>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_per_hour` requests per client.
    ///
    /// Zero disables limiting entirely.
    pub fn per_hour(max_per_hour: u32) -> Self {
        Self::from_quota(NonZeroU32::new(max_per_hour).map(Quota::per_hour))
    }

    fn from_quota(quota: Option<Quota>) -> Self {
        Self {
            limiter: quota.map(|q| Arc::new(DefaultKeyedRateLimiter::keyed(q))),
        }
    }

    /// Create a limiter that never rejects.
    pub fn disabled() -> Self {
        Self { limiter: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Check if a request is allowed for the given client key.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the request is allowed
    /// * `Err(AppError::RateLimitExceeded)` if the rate limit is exceeded
    pub fn check_rate_limit(&self, key: &str) -> Result<(), AppError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        match limiter.check_key(&key.to_string()) {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(client = %key, "Rate limit exceeded");
                Err(AppError::RateLimitExceeded(RATE_LIMIT_MESSAGE.to_string()))
            }
        }
    }

    /// Drop the state of every client whose bucket is full again.
    ///
    /// Such a client is indistinguishable from one never seen, so nothing
    /// about its limit changes.
    pub fn evict_idle(&self) {
        if let Some(limiter) = &self.limiter {
            let before = limiter.len();
            limiter.retain_recent();
            limiter.shrink_to_fit();
            let evicted = before.saturating_sub(limiter.len());
            if evicted > 0 {
                tracing::debug!(evicted, remaining = limiter.len(), "Evicted idle rate limit states");
            }
        }
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` on the current runtime.
    ///
    /// Returns `None` when limiting is disabled.
    pub fn spawn_eviction(&self, every: Duration) -> Option<JoinHandle<()>> {
        self.limiter.as_ref()?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.evict_idle();
            }
        }))
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.as_ref().map_or(0, |l| l.len())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::disabled()
    }
}
