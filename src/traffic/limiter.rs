use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-backend admission gate. Every non-passthrough connection waits here
/// just before its upstream dial or HTTP handoff.
pub struct BackendLimiter {
    inner: Option<DirectLimiter>,
    // A configured rate of zero grants `burst` admissions and then parks
    // callers forever; governor cannot express a zero refill rate.
    frozen_pool: Option<AtomicU64>,
}

impl BackendLimiter {
    pub fn new(config: Option<&RateLimitConfig>) -> Self {
        match config {
            None => BackendLimiter { inner: None, frozen_pool: None },
            Some(c) => match NonZeroU32::new(c.requests_per_second) {
                None => BackendLimiter {
                    inner: None,
                    frozen_pool: Some(AtomicU64::new(c.burst as u64)),
                },
                Some(rate) => {
                    let burst = NonZeroU32::new(c.burst).unwrap_or(nonzero!(1u32));
                    BackendLimiter {
                        inner: Some(GovernorLimiter::direct(
                            Quota::per_second(rate).allow_burst(burst),
                        )),
                        frozen_pool: None,
                    }
                }
            },
        }
    }

    /// Waits for an admission token. Returns Err when the proxy shuts down
    /// while the caller is parked.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ()> {
        if let Some(pool) = &self.frozen_pool {
            let got = pool
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if got {
                return Ok(());
            }
            cancel.cancelled().await;
            return Err(());
        }
        match &self.inner {
            None => Ok(()),
            Some(limiter) => {
                tokio::select! {
                    _ = limiter.until_ready() => Ok(()),
                    _ = cancel.cancelled() => Err(()),
                }
            }
        }
    }
}
