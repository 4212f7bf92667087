//! Fixed-window rate limiting for claims.
//!
//! A window opens on its first hit and counts hits until it expires. Once
//! `count >= max` the window is exhausted and claims report its remaining
//! time. Each queue has one global window; a limiter with a `group_key`
//! additionally keeps one window per group value found in the job data, and
//! groups never block one another.
//!
//! ## Dynamic throttle
//!
//! A handler that learns about an external limit can saturate a window for
//! a given time with [`Queue::rate_limit`](crate::Queue::rate_limit) or
//! [`Queue::rate_limit_group`](crate::Queue::rate_limit_group) and return
//! [`JobError::RateLimited`](crate::JobError::RateLimited).

use crate::clock::{self, millis, millis_u64};
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    /// Claims allowed per window
    pub max: u64,
    /// Window length (ms)
    pub duration_ms: u64,
    /// Job data field whose value selects a per-group window
    pub group_key: Option<String>,
    /// Upper bound on how long a group-limited job is pushed back (ms)
    pub max_delay_ms: Option<u64>,
}

impl RateLimiterOptions {
    /// Allow `max` claims per `duration`.
    pub fn new(max: u64, duration: Duration) -> Self {
        Self {
            max,
            duration_ms: millis_u64(duration),
            group_key: None,
            max_delay_ms: None,
        }
    }

    /// Limit each group separately.
    pub fn with_group_key(mut self, field: impl Into<String>) -> Self {
        self.group_key = Some(field.into());
        self
    }

    /// Cap the delay given to group-limited jobs.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(millis_u64(max_delay));
        self
    }

    /// Check the options.
    pub fn validate(&self) -> QueueResult<()> {
        if self.max == 0 {
            return Err(QueueError::Config("limiter max must be at least 1".into()));
        }
        if self.duration_ms == 0 {
            return Err(QueueError::Config("limiter duration must be non-zero".into()));
        }
        if self.group_key.as_deref().is_some_and(str::is_empty) {
            return Err(QueueError::Config("limiter group key must not be empty".into()));
        }
        Ok(())
    }

    /// Group a job belongs to, if this limiter is grouped and the job data
    /// carries a string or number under the group key.
    pub fn group_of(&self, job: &Job) -> Option<String> {
        let field = self.group_key.as_deref()?;
        match job.data.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// How long a group-limited job that has already been held back for
    /// `waited` ms waits before being retried, or `None` once `max_delay`
    /// has run out and the job must go through regardless.
    pub(crate) fn group_delay(&self, ttl: i64, waited: i64) -> Option<i64> {
        match self.max_delay_ms {
            Some(max) => {
                let remaining = i64::try_from(max).unwrap_or(i64::MAX).saturating_sub(waited);
                (remaining > 0).then(|| ttl.min(remaining))
            }
            None => Some(ttl),
        }
    }
}

/// One counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    /// Hits so far
    pub count: u64,
    /// Expiry (ms)
    pub expires_at: i64,
}

impl RateLimitWindow {
    /// Whether the window still applies at `now`.
    pub fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }

    /// Remaining time when the window is exhausted for `max`.
    pub fn ttl(&self, now: i64, max: u64) -> Option<i64> {
        (self.is_live(now) && self.count >= max).then(|| self.expires_at.saturating_sub(now))
    }
}

/// Remaining time of an optional window.
pub(crate) fn window_ttl(window: Option<&RateLimitWindow>, now: i64, max: u64) -> Option<i64> {
    window.and_then(|w| w.ttl(now, max))
}

/// Count a hit, opening a fresh window when the previous one expired.
pub(crate) fn hit(window: &mut Option<RateLimitWindow>, now: i64, duration_ms: u64) {
    match window {
        Some(w) if w.is_live(now) => w.count = w.count.saturating_add(1),
        _ => {
            *window = Some(RateLimitWindow {
                count: 1,
                expires_at: clock::after(now, duration_ms),
            })
        }
    }
}

/// A window that stays exhausted for `expire`.
pub(crate) fn saturated(now: i64, expire: Duration) -> RateLimitWindow {
    RateLimitWindow {
        count: u64::MAX,
        expires_at: now.saturating_add(millis(expire)),
    }
}
