//! Retry strategies and backoff policies for job execution.
//!
//! Most of the job runtime retries with small constant backoff (spawn
//! glitches, source fetches, plugin clones), so the constant strategy is
//! the workhorse here; exponential and linear remain available for
//! callers talking to rate-limited services.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rigger_retry::{Attempt, Retrier, RetryConfig};
//!
//! let retrier = Retrier::new(RetryConfig::constant(3, Duration::ZERO));
//! let result: Result<&str, &str> = retrier.run(|attempt| {
//!     if attempt < 2 { Attempt::Retry("transient") } else { Attempt::Done("ok") }
//! });
//! assert_eq!(result, Ok("ok"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy for computing the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// No delay between attempts.
    Immediate,
    /// Same delay every attempt (default).
    #[default]
    Constant,
    /// Delay doubles each attempt.
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
}

/// Configuration for a retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Total number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_delay", with = "humantime_serde")]
    pub delay: Duration,
    /// Cap for computed delays.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor: 0.5 turns a delay d into d * (0.5..1.5).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Constant,
            max_attempts: 3,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Constant backoff: `max_attempts` attempts, `delay` between them.
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Constant,
            max_attempts,
            delay,
            ..Self::default()
        }
    }

    /// Exponential backoff starting at `delay`.
    pub fn exponential(max_attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts,
            delay,
            max_delay,
            jitter: 0.5,
        }
    }
}

/// Delay before attempt `attempt + 1`, for a 1-indexed `attempt`.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategy::Immediate => Duration::ZERO,
        RetryStrategy::Constant => config.delay,
        RetryStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategy::Linear => config.delay.saturating_mul(attempt),
    };

    let capped = delay.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 maps a delay d into d * (0.5..1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let mut rng = rand::rng();
    let random: f64 = rng.random();
    let factor = 1.0 - jitter + (random * 2.0 * jitter);
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// Outcome of one attempt inside [`Retrier::run`].
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Success; stop retrying.
    Done(T),
    /// Transient failure; retry if attempts remain.
    Retry(E),
    /// Terminal failure; stop retrying regardless of attempts left.
    Break(E),
}

/// Runs a fallible operation under a [`RetryConfig`], optionally watching
/// a cancellation flag between attempts.
pub struct Retrier {
    config: RetryConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Watch `flag`; once set, the loop returns the pending error without
    /// sleeping out the remaining backoff.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Run `operation` until it returns [`Attempt::Done`] or
    /// [`Attempt::Break`], or attempts run out. The closure receives the
    /// 1-indexed attempt number.
    pub fn run<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Attempt<T, E>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Attempt::Done(v) => return Ok(v),
                Attempt::Break(e) => return Err(e),
                Attempt::Retry(e) => {
                    if attempt >= self.config.max_attempts || self.cancelled() {
                        return Err(e);
                    }
                    self.sleep(calculate_delay(&self.config, attempt));
                    if self.cancelled() {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Sleep in short slices so a cancellation flag is observed promptly.
    fn sleep(&self, total: Duration) {
        const SLICE: Duration = Duration::from_millis(100);
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.cancelled() {
                return;
            }
            let step = remaining.min(SLICE);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}
