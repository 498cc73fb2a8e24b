//! Submission rate limiting.
//!
//! A token bucket over a rolling window: every admission is recorded with
//! its cost, and a new admission is granted only while the costs admitted
//! during the trailing window plus its own cost stay within the ceiling.
//! One limiter is shared by all submission workers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rolling-window token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    ceiling: u64,
    window: Duration,
    ledger: Mutex<Ledger>,
}

#[derive(Debug, Default)]
struct Ledger {
    admitted: VecDeque<(Instant, u64)>,
    spent: u64,
}

impl Ledger {
    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, cost)) = self.admitted.front() {
            if now.duration_since(at) < window {
                break;
            }
            self.admitted.pop_front();
            self.spent -= cost;
        }
    }
}

impl RateLimiter {
    /// Limit to `ceiling` units per second.
    #[cfg(test)]
    pub fn per_second(ceiling: u64) -> Self {
        Self::new(ceiling, Duration::from_secs(1))
    }

    /// Limit to `ceiling` units per `window`.
    pub fn new(ceiling: u64, window: Duration) -> Self {
        Self {
            ceiling: ceiling.max(1),
            window,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Wait until `cost` units may be spent, then spend them.
    ///
    /// Returns the admission instant. A cost above the ceiling is admitted
    /// alone, once nothing else is in the window.
    pub async fn acquire(&self, cost: u64) -> Instant {
        if cost > self.ceiling {
            warn!(
                "Request of {} units exceeds the rate ceiling of {}; admitting it alone",
                cost, self.ceiling
            );
        }

        loop {
            let wait = match self.try_admit(cost, Instant::now()) {
                Ok(admitted_at) => return admitted_at,
                Err(wait) => wait,
            };
            debug!("Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Admit `cost` at `now`, or return how long to wait before trying again.
    fn try_admit(&self, cost: u64, now: Instant) -> Result<Instant, Duration> {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ledger.expire(now, self.window);

        if ledger.spent + cost <= self.ceiling || ledger.admitted.is_empty() {
            ledger.admitted.push_back((now, cost));
            ledger.spent += cost;
            return Ok(now);
        }

        // Find the oldest admission whose expiry frees enough room.
        let needed = ledger.spent + cost.min(self.ceiling) - self.ceiling;
        let mut freed = 0;
        for &(at, spent) in &ledger.admitted {
            freed += spent;
            if freed >= needed {
                let expires = at + self.window;
                return Err(expires.saturating_duration_since(now).max(Duration::from_millis(1)));
            }
        }
        // Unreachable in practice: expiring everything always frees `needed`.
        Err(self.window)
    }
}
