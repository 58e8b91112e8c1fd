//! Global search timer and the search pass that drives it.
//!
//! The timer follows an exponential backoff between the configured bounds.
//! Creating a channel or losing a connection resets it so the next pass runs
//! immediately.

use std::time::Duration;

use super::ClientContext;
use crate::error::CaResult;

/// Backoff state of the global search timer.
#[derive(Debug, Clone)]
pub struct SearchTimer {
    delay: Duration,
    initial: Duration,
    max: Duration,
    resets: u64,
}

impl SearchTimer {
    /// Create a timer that fires immediately.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            initial,
            max,
            resets: 0,
        }
    }

    /// Delay until the next pass.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Number of resets so far.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Fire on the next check.
    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
        self.resets += 1;
    }

    /// Back off after a completed pass and return the new delay.
    pub fn backoff(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            self.initial
        } else {
            (self.delay * 2).min(self.max)
        };
        self.delay
    }
}

impl ClientContext {
    /// Delay until the next search pass is due.
    pub fn search_delay(&self) -> Duration {
        self.lock().search_timer.delay()
    }

    /// Number of times the search timer has been reset.
    pub fn search_resets(&self) -> u64 {
        self.lock().search_timer.resets()
    }

    /// Send searches for up to `search_batch` channels waiting on the
    /// datagram transport, then back the timer off.
    ///
    /// Each sent channel moves to the tail of the list, so consecutive passes
    /// walk every unresolved channel.
    ///
    /// # Errors
    ///
    /// Stops at the first channel whose search cannot be sent and returns
    /// that error; the timer is left untouched so the pass is retried.
    pub fn search_pass(&self) -> CaResult<usize> {
        let batch = self.datagram().channel_list().head(self.config().search_batch);
        let mut sent = 0;
        for cid in batch {
            self.search_channel(cid)?;
            sent += 1;
        }
        let delay = self.lock().search_timer.backoff();
        tracing::debug!(sent, next_delay_ms = delay.as_millis() as u64, "search pass complete");
        Ok(sent)
    }
}
