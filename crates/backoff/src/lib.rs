#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Computes the absolute wall-clock time at which a streamer should attempt
//! its next `Fetch`, given a retry count.
//!
//! The policy is truncated exponential backoff with full jitter: sample
//! uniformly from `[MIN, min(MAX, BASE * 2^retries))`. `Clock` and `Rng` are
//! injected so the policy can be tested deterministically.

use std::time::{Duration, SystemTime};

/// Source of the current wall-clock time.
///
/// Implemented by production code over [`SystemTime`] and by tests over a
/// fixed instant, so [`next_fetch_at`] is deterministic to assert against.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> SystemTime;
}

/// A clock backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Source of randomness for jitter.
///
/// `below(0)` must deterministically return `0` (the minimum delay, with no
/// jitter added) rather than panic.
pub trait Rng {
    /// Returns a value uniformly distributed in `[0, bound)`, or `0` if
    /// `bound == 0`.
    fn below(&mut self, bound: u64) -> u64;
}

/// An [`Rng`] backed by [`rand::thread_rng`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        rand::Rng::gen_range(&mut rand::thread_rng(), 0..bound)
    }
}

/// Backoff bounds for [`next_fetch_at`].
///
/// The `Default` impl uses `MIN = 1s`, `BASE = 4s`, `MAX = 32s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// The minimum delay before any retry, regardless of jitter.
    pub min: Duration,
    /// The base of the exponential backoff curve.
    pub base: Duration,
    /// The ceiling the backoff curve is truncated at.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1_000),
            base: Duration::from_millis(4_000),
            max: Duration::from_millis(32_000),
        }
    }
}

/// Computes `clock.now() + sample` where `sample` is drawn uniformly from
/// `[config.min, min(config.max, config.base * 2^retries))`.
///
/// `retries = 0` therefore draws from `[min, base)`. Overflow of `2^retries`
/// saturates to `config.max` rather than wrapping.
pub fn next_fetch_at(retries: u32, config: &BackoffConfig, clock: &impl Clock, rng: &mut impl Rng) -> SystemTime {
    let base_ms = config.base.as_millis().min(u128::from(u64::MAX)) as u64;
    let max_ms = config.max.as_millis().min(u128::from(u64::MAX)) as u64;
    let min_ms = config.min.as_millis().min(u128::from(u64::MAX)) as u64;

    let multiplier = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
    let scaled = base_ms.saturating_mul(multiplier);
    let ceiling_ms = scaled.min(max_ms);

    let span_ms = ceiling_ms.saturating_sub(min_ms);
    let jitter_ms = rng.below(span_ms);
    let sample = Duration::from_millis(min_ms.saturating_add(jitter_ms));

    clock.now() + sample
}
