//! Bounded retry tracker
//!
//! Every operation the controller retries against an external dependency
//! (wifi association, time sync, hello, info, publish) is gated through one
//! of these. A tracker is either neutral, [`ok`](Status::is_ok), or in
//! [`error`](Status::is_error) once its attempt budget is spent.

use embassy_time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    ok: bool,
    error: bool,
    retry_count: u8,
    max_retries: u8,
    timeout: Duration,
    last_attempt: Option<Instant>,
}

impl Status {
    pub const fn new(max_retries: u8, timeout: Duration) -> Self {
        Self {
            ok: false,
            error: false,
            retry_count: 0,
            max_retries,
            timeout,
            last_attempt: None,
        }
    }

    /// Attempt gate.
    ///
    /// Returns `true` when a new attempt may be made: not in error, and either
    /// no attempt was recorded yet or at least `timeout` has passed since the
    /// last one. Once `max_retries` attempts were granted the next eligible
    /// call flips the tracker to error and every call returns `false` until
    /// [`reset`](Self::reset).
    pub fn retry(&mut self, now: Instant) -> bool {
        if self.error {
            return false;
        }

        let window_open = match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.timeout,
        };
        if !window_open {
            return false;
        }

        if self.retry_count >= self.max_retries {
            self.ok = false;
            self.error = true;
            return false;
        }

        self.last_attempt = Some(now);
        self.retry_count += 1;
        true
    }

    pub fn set_ok(&mut self) {
        self.ok = true;
        self.error = false;
        self.retry_count = 0;
        self.last_attempt = None;
    }

    /// Marks the operation failed by an explicit report from the peer.
    /// The budget is treated as spent.
    pub fn set_error(&mut self) {
        self.ok = false;
        self.error = true;
        self.retry_count = self.max_retries;
    }

    pub fn reset(&mut self) {
        self.ok = false;
        self.error = false;
        self.retry_count = 0;
        self.last_attempt = None;
    }

    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    pub const fn is_error(&self) -> bool {
        self.error
    }

    pub const fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub const fn max_retries(&self) -> u8 {
        self.max_retries
    }
}
