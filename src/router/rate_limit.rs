//! Declared rate-limit enforcement.
//!
//! Fixed one-minute windows per provider. A provider whose window is full is
//! skipped for the rest of the window rather than called and rejected upstream.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    windows: DashMap<String, Mutex<Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Take one slot from `provider_id`'s window. `None` means unlimited.
    pub fn try_acquire(&self, provider_id: &str, limit_per_minute: Option<u32>) -> bool {
        let Some(limit) = limit_per_minute else {
            return true;
        };

        let now = Instant::now();
        let entry = self
            .windows
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Mutex::new(Window {
                    started: now,
                    count: 0,
                })
            })
            .downgrade();
        let mut window = entry.value().lock().unwrap_or_else(|e| e.into_inner());

        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }
        if window.count >= limit {
            tracing::debug!(provider = %provider_id, limit, "rate limit window exhausted");
            return false;
        }
        window.count += 1;
        true
    }

    pub fn reset(&self, provider_id: &str) {
        self.windows.remove(provider_id);
    }

    pub fn reset_all(&self) {
        self.windows.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
