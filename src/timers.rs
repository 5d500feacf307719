/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deadlines that make a replica suspect the primary, or give up on a view change.
//!
//! Timers do not run on their own threads. A deadline is an [`Instant`] stored in [`Timers`], and the
//! replica checks for expired deadlines whenever it is [ticked](crate::adapter::Pbft::tick). Since
//! ticking happens on the same single processing path as message handling, cancelling a deadline is
//! simply removing it: a deadline that was cancelled can never be observed as expired.
//!
//! ## Request deadlines
//!
//! A backup starts a deadline for every request it learns about, and cancels it when the request
//! becomes committed-local. If a deadline expires, the replica suspects the primary of the current
//! view.
//!
//! ## View-change deadline
//!
//! A replica that starts a view change arms a single view-change deadline. Every consecutive view
//! change that fails to install a new view doubles its duration:
//!
//! ```text
//! view_change_timeout * 2^min(attempt, max_backoff_exponent)
//! ```
//!
//! The backoff is reset when a new view is installed.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::types::data_types::CryptoHash;

#[derive(Default)]
pub(crate) struct Timers {
    requests: HashMap<CryptoHash, Instant>,
    view_change: Option<Instant>,

    /// Number of view changes started since the last new view was installed.
    attempt: u32,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start a deadline for the request with `digest`, unless one is already running.
    pub(crate) fn start_request(&mut self, digest: CryptoHash, now: Instant, timeout: Duration) {
        self.requests.entry(digest).or_insert(now + timeout);
    }

    pub(crate) fn cancel_request(&mut self, digest: &CryptoHash) {
        self.requests.remove(digest);
    }

    pub(crate) fn clear_requests(&mut self) {
        self.requests.clear();
    }

    /// Remove and return the digests of the requests whose deadline is at or before `now`.
    pub(crate) fn expired_requests(&mut self, now: Instant) -> Vec<CryptoHash> {
        let expired: Vec<CryptoHash> = self
            .requests
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(digest, _)| *digest)
            .collect();
        for digest in &expired {
            self.requests.remove(digest);
        }
        expired
    }

    /// Arm the view-change deadline for a new view-change attempt, and return its duration.
    pub(crate) fn arm_view_change(
        &mut self,
        now: Instant,
        view_change_timeout: Duration,
        max_backoff_exponent: u32,
    ) -> Duration {
        let exponent = self.attempt.min(max_backoff_exponent).min(31);
        let timeout = view_change_timeout.saturating_mul(1u32 << exponent);
        self.view_change = Some(now + timeout);
        self.attempt = self.attempt.saturating_add(1);
        timeout
    }

    /// Check whether the view-change deadline has expired. An expired deadline is removed.
    pub(crate) fn view_change_expired(&mut self, now: Instant) -> bool {
        match self.view_change {
            Some(deadline) if deadline <= now => {
                self.view_change = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel the view-change deadline and reset the backoff.
    pub(crate) fn view_change_completed(&mut self) {
        self.view_change = None;
        self.attempt = 0;
    }

    /// Number of view changes started since the last new view was installed.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn clear(&mut self) {
        self.requests.clear();
        self.view_change = None;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_request_deadlines_never_fire() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let timeout = Duration::from_millis(100);
        let d1 = CryptoHash::new([1u8; 32]);
        let d2 = CryptoHash::new([2u8; 32]);

        timers.start_request(d1, now, timeout);
        timers.start_request(d2, now, timeout);
        // Starting an already running deadline does not push it back.
        timers.start_request(d1, now + timeout, timeout);
        timers.cancel_request(&d2);

        assert!(timers.expired_requests(now).is_empty());
        assert_eq!(timers.expired_requests(now + timeout), vec![d1]);
        assert!(timers.expired_requests(now + timeout * 10).is_empty());
    }

    #[test]
    fn view_change_timeout_backs_off_exponentially() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let base = Duration::from_secs(1);

        assert_eq!(timers.arm_view_change(now, base, 2), base);
        assert_eq!(timers.arm_view_change(now, base, 2), base * 2);
        assert_eq!(timers.arm_view_change(now, base, 2), base * 4);
        // Capped at 2^max_backoff_exponent.
        assert_eq!(timers.arm_view_change(now, base, 2), base * 4);
        assert_eq!(timers.attempt(), 4);

        assert!(!timers.view_change_expired(now + base));
        assert!(timers.view_change_expired(now + base * 4));
        assert!(!timers.view_change_expired(now + base * 4));

        timers.arm_view_change(now, base, 2);
        timers.view_change_completed();
        assert!(!timers.view_change_expired(now + base * 100));
        assert_eq!(timers.arm_view_change(now, base, 2), base);
    }
}
