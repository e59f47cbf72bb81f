//! Scan-start rate limiting.
//!
//! BLE platforms throttle apps that start scanning more than 5 times in a
//! 30-second window; exceeding the budget silently degrades discovery. The
//! limiter reserves a slot before the hardware call and supports rollback
//! when the start fails after reservation.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Proof of a reserved scan-start slot.
///
/// Returned by [`ScanRateLimiter::try_acquire`]; pass it back to
/// [`ScanRateLimiter::rollback`] if the hardware start call fails.
#[derive(Debug)]
pub struct ScanToken {
    started_at: Instant,
}

/// Sliding-window limiter over scan starts.
pub struct ScanRateLimiter {
    max_starts: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl ScanRateLimiter {
    /// Creates a limiter allowing `max_starts` per `window`.
    #[must_use]
    pub fn new(max_starts: usize, window: Duration) -> Self {
        Self {
            max_starts,
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Reserves a scan-start slot.
    ///
    /// Returns `Ok(token)` when fewer than the budget of starts happened in
    /// the window, else `Err(retry_after)` — the wait until the oldest start
    /// leaves the window.
    pub fn try_acquire(&self) -> Result<ScanToken, Duration> {
        let now = Instant::now();
        let mut starts = self.starts.lock();
        while let Some(oldest) = starts.front() {
            if now.duration_since(*oldest) >= self.window {
                starts.pop_front();
            } else {
                break;
            }
        }
        if starts.len() < self.max_starts {
            starts.push_back(now);
            Ok(ScanToken { started_at: now })
        } else {
            let oldest = *starts.front().expect("window is full");
            Err(self.window.saturating_sub(now.duration_since(oldest)))
        }
    }

    /// Returns a reserved slot to the pool.
    ///
    /// For use when the hardware start call fails after reservation.
    pub fn rollback(&self, token: ScanToken) {
        let mut starts = self.starts.lock();
        if let Some(pos) = starts.iter().position(|t| *t == token.started_at) {
            starts.remove(pos);
        }
    }
}
