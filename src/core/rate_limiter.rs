//! Shared admission gate bounding calls per reset window.
//!
//! The limiter is a leaky bucket: a background task zeroes the counter at a
//! fixed interval regardless of outstanding load. A burst that straddles a
//! reset can therefore briefly reach twice the nominal rate; downstream call
//! budgets are tuned against that behaviour, so it is kept.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::domain::{CallError, Lane};

/// Rate limiter configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit for '{name}' must be at least 1")]
    ZeroLimit { name: String },

    #[error("{which} interval for '{name}' must be greater than zero")]
    ZeroInterval { name: String, which: &'static str },
}

/// Window state, always mutated under the lock
#[derive(Debug)]
struct WindowState {
    limit: u32,
    admitted: u32,
    window_start: Instant,
}

#[derive(Debug)]
struct LimiterInner {
    name: String,
    state: Mutex<WindowState>,
    reset_interval: Duration,
    poll_interval: Duration,
    resets_started: AtomicBool,
}

impl LimiterInner {
    fn reset(&self) {
        let mut state = self.state.lock();
        let (admitted, window) = (state.admitted, state.window_start.elapsed());
        state.admitted = 0;
        state.window_start = Instant::now();
        drop(state);
        debug!(
            limiter = %self.name,
            admitted,
            window_ms = window.as_millis() as u64,
            "Rate limit window reset"
        );
    }
}

/// Admission gate shared by reference across workers
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Create a limiter; resets do not run until `start_resets` is called
    pub fn new(
        name: impl Into<String>,
        limit: u32,
        reset_interval: Duration,
    ) -> Result<Self, RateLimitError> {
        let name = name.into();
        if limit == 0 {
            return Err(RateLimitError::ZeroLimit { name });
        }
        if reset_interval.is_zero() {
            return Err(RateLimitError::ZeroInterval {
                name,
                which: "reset",
            });
        }

        Ok(Self {
            inner: Arc::new(LimiterInner {
                name,
                state: Mutex::new(WindowState {
                    limit,
                    admitted: 0,
                    window_start: Instant::now(),
                }),
                reset_interval,
                poll_interval: Duration::from_millis(100),
                resets_started: AtomicBool::new(false),
            }),
        })
    }

    /// Override the admission poll interval (default 100ms)
    pub fn with_poll_interval(self, poll_interval: Duration) -> Result<Self, RateLimitError> {
        if poll_interval.is_zero() {
            return Err(RateLimitError::ZeroInterval {
                name: self.inner.name.clone(),
                which: "poll",
            });
        }
        Ok(match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.poll_interval = poll_interval;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        })
    }

    /// Create a limiter and start its background resets
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        name: impl Into<String>,
        limit: u32,
        reset_interval: Duration,
    ) -> Result<Self, RateLimitError> {
        let limiter = Self::new(name, limit, reset_interval)?;
        limiter.start_resets();
        Ok(limiter)
    }

    /// Spawn the background task that zeroes the counter every interval
    ///
    /// Idempotent: a second call does not start a second task. The task
    /// stops once every handle to the limiter has been dropped.
    pub fn start_resets(&self) {
        if self.inner.resets_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<LimiterInner> = Arc::downgrade(&self.inner);
        let period = self.inner.reset_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.reset(),
                    None => break,
                }
            }
        });

        info!(
            limiter = %self.inner.name,
            limit = self.limit(),
            reset_ms = period.as_millis() as u64,
            "Rate limiter resets started"
        );
    }

    /// Try to take one admission in the current window
    pub fn try_acquire(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.admitted < state.limit {
            state.admitted += 1;
            true
        } else {
            false
        }
    }

    /// Wait until admission is granted; never rejects
    pub async fn acquire(&self) {
        let mut waited = false;
        while !self.try_acquire() {
            if !waited {
                debug!(limiter = %self.inner.name, "Rate limit reached, waiting for reset");
                waited = true;
            }
            tokio::time::sleep(self.inner.poll_interval).await;
        }
    }

    /// Change the bound for subsequent admissions
    pub fn update_limit(&self, limit: u32) -> Result<(), RateLimitError> {
        if limit == 0 {
            return Err(RateLimitError::ZeroLimit {
                name: self.inner.name.clone(),
            });
        }
        let previous = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.limit, limit)
        };
        if previous != limit {
            info!(limiter = %self.inner.name, previous, limit, "Rate limit updated");
        }
        Ok(())
    }

    /// Reset the window immediately
    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn limit(&self) -> u32 {
        self.inner.state.lock().limit
    }

    /// Admissions granted since the last reset
    pub fn admitted_in_window(&self) -> u32 {
        self.inner.state.lock().admitted
    }
}

/// Something that can admit a call on a lane
#[async_trait]
pub trait Admission: Send + Sync {
    /// Block until the lane admits one more call
    async fn admit(&self, lane: Lane) -> Result<(), CallError>;
}

/// Limiter settings (from the `limits` config section)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Search requests per reset window
    #[serde(default = "default_search_per_sec")]
    pub search_per_sec: u32,

    /// Language-model requests per reset window
    #[serde(default = "default_llm_per_sec")]
    pub llm_per_sec: u32,

    /// Counter reset period in milliseconds
    #[serde(default = "default_reset_interval")]
    pub reset_interval_ms: u64,

    /// Admission poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_search_per_sec() -> u32 {
    30
}
fn default_llm_per_sec() -> u32 {
    5
}
fn default_reset_interval() -> u64 {
    2000
}
fn default_poll_interval() -> u64 {
    100
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            search_per_sec: default_search_per_sec(),
            llm_per_sec: default_llm_per_sec(),
            reset_interval_ms: default_reset_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// One limiter per lane, injected into runners and stages
#[derive(Debug, Clone)]
pub struct RateLimiters {
    search: RateLimiter,
    llm: RateLimiter,
}

impl RateLimiters {
    /// Build both limiters (resets not started)
    pub fn from_settings(settings: &LimitSettings) -> Result<Self, RateLimitError> {
        let reset = Duration::from_millis(settings.reset_interval_ms);
        let poll = Duration::from_millis(settings.poll_interval_ms);
        Ok(Self {
            search: RateLimiter::new("search", settings.search_per_sec, reset)?
                .with_poll_interval(poll)?,
            llm: RateLimiter::new("llm", settings.llm_per_sec, reset)?.with_poll_interval(poll)?,
        })
    }

    /// Start background resets for both lanes
    pub fn start_resets(&self) {
        self.search.start_resets();
        self.llm.start_resets();
    }

    pub fn limiter(&self, lane: Lane) -> &RateLimiter {
        match lane {
            Lane::Search => &self.search,
            Lane::Llm => &self.llm,
        }
    }
}

#[async_trait]
impl Admission for RateLimiters {
    async fn admit(&self, lane: Lane) -> Result<(), CallError> {
        self.limiter(lane).acquire().await;
        Ok(())
    }
}
