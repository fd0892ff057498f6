//! Fixed-window rate limiting keyed by agent identity.
//!
//! One window per identity, held in a single mutex-guarded map so the
//! check-and-increment is atomic. The table is process-local: with N server
//! instances the effective capacity is N times `max_requests`.

use crate::core::config::RateLimitConfig;
use crate::core::error::AgentFeedError;
use crate::core::time::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateWindow {
    count: u32,
    /// Epoch milliseconds.
    reset_at: u64,
}

impl RateWindow {
    fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at
    }
}

/// Result of a `check`, exposed to callers as rate-limit headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds.
    pub reset_at: u64,
    /// Only set on denied checks.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitSnapshot {
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at / 1000
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` when throttled.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit".to_string(), self.limit.to_string()),
            ("X-RateLimit-Remaining".to_string(), self.remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), self.reset_epoch_secs().to_string()),
        ];
        if let Some(retry) = self.retry_after_secs {
            headers.push(("Retry-After".to_string(), retry.to_string()));
        }
        headers
    }
}

/// Read-only view of an identity's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub count: u32,
    pub remaining: u32,
    pub reset_at: u64,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window(),
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, RateWindow>>, AgentFeedError> {
        self.windows
            .lock()
            .map_err(|_| AgentFeedError::LockPoisoned("rate limit table".to_string()))
    }

    fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Charge one call against `identity_id` and report whether it fits.
    pub fn check(&self, identity_id: &str) -> Result<RateLimitSnapshot, AgentFeedError> {
        let now = self.clock.now_ms();
        let mut windows = self.lock()?;

        match windows.get_mut(identity_id) {
            Some(window) if !window.expired(now) => {
                if window.count < self.max_requests {
                    window.count += 1;
                    Ok(RateLimitSnapshot {
                        allowed: true,
                        limit: self.max_requests,
                        remaining: self.max_requests - window.count,
                        reset_at: window.reset_at,
                        retry_after_secs: None,
                    })
                } else {
                    let wait_ms = window.reset_at - now;
                    Ok(RateLimitSnapshot {
                        allowed: false,
                        limit: self.max_requests,
                        remaining: 0,
                        reset_at: window.reset_at,
                        retry_after_secs: Some(wait_ms.div_ceil(1000)),
                    })
                }
            }
            _ => {
                let window = RateWindow {
                    count: 1,
                    reset_at: now.saturating_add(self.window_ms()),
                };
                windows.insert(identity_id.to_string(), window);
                Ok(RateLimitSnapshot {
                    allowed: true,
                    limit: self.max_requests,
                    remaining: self.max_requests - 1,
                    reset_at: window.reset_at,
                    retry_after_secs: None,
                })
            }
        }
    }

    /// Current window state without charging a call.
    pub fn status(&self, identity_id: &str) -> Result<RateLimitStatus, AgentFeedError> {
        let now = self.clock.now_ms();
        let windows = self.lock()?;
        Ok(match windows.get(identity_id) {
            Some(w) if !w.expired(now) => RateLimitStatus {
                count: w.count,
                remaining: self.max_requests.saturating_sub(w.count),
                reset_at: w.reset_at,
            },
            _ => RateLimitStatus {
                count: 0,
                remaining: self.max_requests,
                reset_at: now.saturating_add(self.window_ms()),
            },
        })
    }

    pub fn reset(&self, identity_id: &str) -> Result<(), AgentFeedError> {
        self.lock()?.remove(identity_id);
        Ok(())
    }

    /// Drop every expired window. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize, AgentFeedError> {
        let now = self.clock.now_ms();
        let mut windows = self.lock()?;
        let before = windows.len();
        windows.retain(|_, w| !w.expired(now));
        Ok(before - windows.len())
    }

    pub fn tracked_identities(&self) -> Result<usize, AgentFeedError> {
        Ok(self.lock()?.len())
    }
}

/// Background thread running [`RateLimiter::sweep`] once per window length.
/// Dropping the handle stops and joins the thread.
pub struct SweeperHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

pub fn spawn_sweeper(limiter: Arc<RateLimiter>) -> SweeperHandle {
    let interval = limiter.window();
    spawn_sweeper_every(limiter, interval)
}

pub fn spawn_sweeper_every(limiter: Arc<RateLimiter>, interval: Duration) -> SweeperHandle {
    let (tx, rx) = mpsc::channel::<()>();
    let thread = thread::spawn(move || {
        loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if limiter.sweep().is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });
    SweeperHandle {
        stop: Some(tx),
        thread: Some(thread),
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
