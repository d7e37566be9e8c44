//! # Rate Limiter
//!
//! The process-wide throughput governor shared by every request-queue producer.
//!
//! [`RateLimiter`] is the narrow contract the engine needs: a blocking
//! [`acquire`](RateLimiter::acquire), plus [`rate`](RateLimiter::rate) /
//! [`set_rate`](RateLimiter::set_rate) for the optimizer. [`TokenBucket`] is
//! the bundled implementation.
//!
//! ## Token bucket model
//!
//! Permits are issued on a fixed schedule of one every `1 / rate` seconds.
//! The bucket keeps the instant at which the next permit becomes free; an
//! `acquire` reserves permits against that schedule under a short lock and
//! then sleeps **outside** the lock, so concurrent producers queue up fairly
//! without holding each other up while they wait.
//!
//! Unused time accumulates as stored permits (at most one second's worth),
//! which are spent before the schedule is pushed forward. A reservation
//! always succeeds immediately and charges the *following* caller, so a
//! large request never starves the bucket.
//!
//! The current rate is mirrored in an `AtomicU64` (bit pattern of the `f64`)
//! so readers never contend with producers.


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{trace, warn};

/// Upper bound on stored permits, expressed in seconds of traffic.
const MAX_BURST_SECONDS: f64 = 1.0;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum LimiterError {
    /// Rates must be finite and strictly positive.
    #[error("invalid rate {0}: must be finite and > 0")]
    InvalidRate(f64),
}

// ------------------------------------------------------------------------------------------------
// RateLimiter trait
// ------------------------------------------------------------------------------------------------

/// A thread-safe permits-per-second governor.
pub trait RateLimiter: Send + Sync {
    /// Blocks until `permits` may be used. Returns the time spent waiting.
    fn acquire(&self, permits: u32) -> Duration;

    /// Current rate in permits per second.
    fn rate(&self) -> f64;

    /// Changes the rate. Takes effect for the next reservation.
    fn set_rate(&self, rate: f64);
}

// ------------------------------------------------------------------------------------------------
// TokenBucket
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct BucketState {
    /// Seconds between two permits at the current rate.
    interval: f64,
    stored: f64,
    max_stored: f64,
    next_free: Instant,
}

impl BucketState {
    /// Credits idle time since `next_free` as stored permits.
    fn resync(&mut self, now: Instant) {
        if now > self.next_free {
            let idle = now.duration_since(self.next_free).as_secs_f64();
            self.stored = (self.stored + idle / self.interval).min(self.max_stored);
            self.next_free = now;
        }
    }
}

/// Smooth token bucket with a one-second burst allowance.
#[derive(Debug)]
pub struct TokenBucket {
    rate_bits: AtomicU64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a bucket issuing `rate` permits per second, starting empty.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::InvalidRate`] unless `rate` is finite and > 0.
    pub fn new(rate: f64) -> Result<Self, LimiterError> {
        if !is_valid_rate(rate) {
            return Err(LimiterError::InvalidRate(rate));
        }
        Ok(Self {
            rate_bits: AtomicU64::new(rate.to_bits()),
            state: Mutex::new(BucketState {
                interval: 1.0 / rate,
                stored: 0.0,
                max_stored: rate * MAX_BURST_SECONDS,
                next_free: Instant::now(),
            }),
        })
    }

    /// Reserves `permits` and returns the instant the caller may proceed.
    fn reserve(&self, permits: u32) -> Instant {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.resync(now);

        let ready_at = state.next_free;
        let requested = f64::from(permits);
        let from_store = requested.min(state.stored);
        let fresh = requested - from_store;

        state.stored -= from_store;
        let charge = Duration::try_from_secs_f64(fresh * state.interval).unwrap_or(Duration::MAX);
        state.next_free = state.next_free.checked_add(charge).unwrap_or(state.next_free);

        ready_at
    }
}

fn is_valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

impl RateLimiter for TokenBucket {
    fn acquire(&self, permits: u32) -> Duration {
        let ready_at = self.reserve(permits);
        let wait = ready_at.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            trace!(wait_us = wait.as_micros() as u64, permits, "rate limiter wait");
            thread::sleep(wait);
        }
        wait
    }

    fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    fn set_rate(&self, rate: f64) {
        if !is_valid_rate(rate) {
            warn!(rate, "ignoring invalid rate limiter value");
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.resync(Instant::now());

        let old_max = state.max_stored;
        state.interval = 1.0 / rate;
        state.max_stored = rate * MAX_BURST_SECONDS;
        // Keep the same fraction of the burst allowance.
        state.stored = if old_max > 0.0 {
            state.stored * state.max_stored / old_max
        } else {
            0.0
        };

        self.rate_bits.store(rate.to_bits(), Ordering::Release);
    }
}
