//! Aggregate publish rate limiter
//!
//! A single token bucket shared by every worker. Tokens refill continuously at
//! the configured rate; the bucket holds at most `burst` tokens and never goes
//! into debt, so completions over any window `W` stay within
//! `rate * W + burst`.

use crate::config::RateLimit;
use crate::error::PipelineError;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Shared publish limiter; `Disabled` is a pass-through
pub enum PublishLimiter {
    Disabled,
    Limited {
        limiter: DefaultDirectRateLimiter,
        per_second: f64,
        burst: u32,
    },
}

impl PublishLimiter {
    pub fn new(limit: RateLimit) -> Result<Self, PipelineError> {
        match limit {
            RateLimit::Disabled => Ok(PublishLimiter::Disabled),
            RateLimit::PerSecond { per_second, burst } => {
                let period = Duration::try_from_secs_f64(1.0 / per_second)
                    .ok()
                    .filter(|p| !p.is_zero())
                    .ok_or_else(|| {
                        PipelineError::config(format!("unusable rate limit: {}", per_second))
                    })?;
                let burst_size = NonZeroU32::new(burst).ok_or_else(|| {
                    PipelineError::config("rate limit burst must be at least 1")
                })?;
                let quota = Quota::with_period(period)
                    .ok_or_else(|| {
                        PipelineError::config(format!("unusable rate limit: {}", per_second))
                    })?
                    .allow_burst(burst_size);

                Ok(PublishLimiter::Limited {
                    limiter: RateLimiter::direct(quota),
                    per_second,
                    burst,
                })
            }
        }
    }

    pub fn disabled() -> Self {
        PublishLimiter::Disabled
    }

    /// Wait for a permit. Completes immediately when disabled.
    pub async fn acquire(&self) {
        if let PublishLimiter::Limited { limiter, .. } = self {
            limiter.until_ready().await;
        }
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        match self {
            PublishLimiter::Disabled => true,
            PublishLimiter::Limited { limiter, .. } => limiter.check().is_ok(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, PublishLimiter::Limited { .. })
    }

    /// `(rate, burst)` when limited
    pub fn limits(&self) -> Option<(f64, u32)> {
        match self {
            PublishLimiter::Disabled => None,
            PublishLimiter::Limited {
                per_second, burst, ..
            } => Some((*per_second, *burst)),
        }
    }
}

impl std::fmt::Debug for PublishLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishLimiter::Disabled => f.write_str("PublishLimiter::Disabled"),
            PublishLimiter::Limited {
                per_second, burst, ..
            } => f
                .debug_struct("PublishLimiter::Limited")
                .field("per_second", per_second)
                .field("burst", burst)
                .finish(),
        }
    }
}
