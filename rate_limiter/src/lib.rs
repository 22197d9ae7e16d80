// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Bytes-per-time-slice rate limiter.
//!
//! The limiter divides time into fixed slices and grants each slice a
//! quota derived from the configured speed. Callers account the bytes
//! they dispatch and receive back how long to sleep once the running
//! slice's quota is exhausted. Throttling is advisory backpressure: the
//! caller decides when (and whether) to honor the delay.

#[macro_use]
extern crate log;

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    slice_quota: u64,
    slice_ns: u64,
    slice_end: Option<Instant>,
    dispatched: u64,
}

impl RateLimiter {
    /// An unlimited limiter; every delay is zero until a speed is set.
    pub fn new() -> Self {
        RateLimiter {
            slice_quota: 0,
            slice_ns: 0,
            slice_end: None,
            dispatched: 0,
        }
    }

    /// Configure the limiter for `bytes_per_sec` over `slice` long slices.
    /// A speed of zero disables limiting.
    pub fn set_speed(&mut self, bytes_per_sec: u64, slice: Duration) {
        let slice_ns = slice.as_nanos() as u64;
        self.slice_ns = slice_ns;
        self.slice_quota = if bytes_per_sec == 0 {
            0
        } else {
            ((bytes_per_sec as u128 * slice_ns as u128) / 1_000_000_000).max(1) as u64
        };
        debug!(
            "rate limiter: speed {} B/s, {} B per {} ns slice",
            bytes_per_sec, self.slice_quota, slice_ns
        );
        self.slice_end = None;
        self.dispatched = 0;
    }

    pub fn is_limited(&self) -> bool {
        self.slice_quota != 0
    }

    /// Account `bytes` dispatched now and return how long the caller
    /// should sleep before dispatching more.
    pub fn calculate_delay(&mut self, bytes: u64) -> Duration {
        self.delay_at(bytes, Instant::now())
    }

    fn delay_at(&mut self, bytes: u64, now: Instant) -> Duration {
        if self.slice_quota == 0 {
            return Duration::ZERO;
        }
        let slice_end = match self.slice_end {
            Some(end) if now < end => end,
            // Previous slice expired (or first call): open a fresh one.
            _ => {
                let end = now + Duration::from_nanos(self.slice_ns);
                self.slice_end = Some(end);
                self.dispatched = 0;
                end
            }
        };
        self.dispatched += bytes;
        if self.dispatched < self.slice_quota {
            Duration::ZERO
        } else {
            slice_end - now
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
