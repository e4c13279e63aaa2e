//! Shared action rate limiter (per-minute and per-hour windows).
//!
//! Both windows are checked and incremented under a single lock, so two
//! concurrent callers can never both slip under a limit through a
//! read-modify-write race. The lock is held only for the bookkeeping.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::policy::RateLimits;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit exceeded: {limit} actions per {window}, retry in {}s", .retry_after.as_secs())]
pub struct RateLimitExceeded {
    pub window: &'static str,
    pub limit: u32,
    pub retry_after: Duration,
}

/// Fixed window counter.
#[derive(Debug)]
struct Window {
    label: &'static str,
    length: Duration,
    limit: u32,
    started: Instant,
    count: u32,
}

impl Window {
    fn new(label: &'static str, length: Duration, limit: u32, now: Instant) -> Self {
        Self {
            label,
            length,
            limit,
            started: now,
            count: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) >= self.length {
            self.started = now;
            self.count = 0;
        }
    }

    fn check(&self, now: Instant) -> Result<(), RateLimitExceeded> {
        if self.count >= self.limit {
            let elapsed = now.saturating_duration_since(self.started);
            return Err(RateLimitExceeded {
                window: self.label,
                limit: self.limit,
                retry_after: self.length.saturating_sub(elapsed),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<[Window; 2]>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        let now = Instant::now();
        Self {
            windows: Mutex::new([
                Window::new("minute", MINUTE, limits.per_minute, now),
                Window::new("hour", HOUR, limits.per_hour, now),
            ]),
        }
    }

    /// Consumes one slot in every window, or none if any window is full.
    pub fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        for window in windows.iter_mut() {
            window.roll(now);
        }
        for window in windows.iter() {
            window.check(now)?;
        }
        for window in windows.iter_mut() {
            window.count += 1;
        }
        Ok(())
    }

    /// Applies new limits (policy reload). Current counts are kept.
    pub fn update_limits(&self, limits: RateLimits) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows[0].limit = limits.per_minute;
        windows[1].limit = limits.per_hour;
    }
}
