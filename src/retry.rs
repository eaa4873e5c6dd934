// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded waiting on a busy or still-executing hardware unit.

use std::cell::Cell;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

/// Source of time for retry loops. Tests use [`ManualClock`] so that no real sleeping happens.
pub trait Clock {
    /// Monotonic time elapsed since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// The wall clock.
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// A clock that only advances when slept on.
#[derive(Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    sleeps: Cell<usize>,
}

impl ManualClock {
    /// Number of times `sleep` has been called.
    pub fn num_sleeps(&self) -> usize {
        self.sleeps.get()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.set(self.sleeps.get() + 1);
        self.advance(duration);
    }
}

/// Result of one attempt of a retried operation.
pub enum Attempt<T> {
    /// The operation completed, successfully or not. Stop retrying.
    Done(T),
    /// The unit is busy: sleep for the policy interval and try again.
    Busy,
    /// Try again right away, e.g. with a fresh surface.
    Again,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("operation still not complete after {attempts} attempts ({elapsed:?})")]
pub struct RetryError {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// How long and how often to retry an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between two busy attempts.
    pub interval: Duration,
    /// Give up once this much time has elapsed since the first attempt.
    pub timeout: Duration,
    /// Give up after this many attempts, whatever the elapsed time.
    pub max_attempts: u32,
    /// Double the interval after every busy attempt.
    pub exponential: bool,
}

impl RetryPolicy {
    /// Policy for submissions rejected because the decode unit is busy.
    pub const DECODE_BUSY: RetryPolicy = RetryPolicy {
        interval: Duration::from_micros(100),
        timeout: Duration::from_secs(1),
        max_attempts: 10_000,
        exponential: false,
    };

    /// Policy for submissions rejected because the post-processing unit is busy.
    pub const VPP_BUSY: RetryPolicy = RetryPolicy {
        interval: Duration::from_micros(500),
        timeout: Duration::from_secs(1),
        max_attempts: 2_000,
        exponential: false,
    };

    /// Policy for waiting on a submitted operation to complete. Each wait call blocks in the
    /// hardware for up to [`SYNC_TIMEOUT`].
    pub const SYNC: RetryPolicy = RetryPolicy {
        interval: Duration::from_micros(100),
        timeout: Duration::from_secs(10),
        max_attempts: 10,
        exponential: false,
    };

    /// Runs `op` until it returns [`Attempt::Done`] or the policy bounds are exceeded. `op`
    /// receives the number of the current attempt, starting at 0.
    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        mut op: impl FnMut(u32) -> Attempt<T>,
    ) -> Result<T, RetryError> {
        let start = clock.now();
        let mut interval = self.interval;
        let mut attempts = 0;

        loop {
            let attempt = op(attempts);
            attempts += 1;

            let busy = match attempt {
                Attempt::Done(res) => return Ok(res),
                Attempt::Busy => true,
                Attempt::Again => false,
            };

            let elapsed = clock.now() - start;
            if attempts >= self.max_attempts || elapsed >= self.timeout {
                return Err(RetryError { attempts, elapsed });
            }

            if busy {
                clock.sleep(interval);
                if self.exponential {
                    interval += interval;
                }
            }
        }
    }
}

/// Timeout passed to every hardware wait call.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(1000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_then_done() {
        let clock = ManualClock::default();
        let res = RetryPolicy::DECODE_BUSY.run(&clock, |attempt| {
            if attempt < 5 {
                Attempt::Busy
            } else {
                Attempt::Done(attempt)
            }
        });

        assert_eq!(res, Ok(5));
        assert_eq!(clock.num_sleeps(), 5);
        assert_eq!(clock.now(), Duration::from_micros(500));
    }

    #[test]
    fn again_does_not_sleep() {
        let clock = ManualClock::default();
        let res = RetryPolicy::DECODE_BUSY.run(&clock, |attempt| {
            if attempt < 3 {
                Attempt::Again
            } else {
                Attempt::Done(())
            }
        });

        assert_eq!(res, Ok(()));
        assert_eq!(clock.num_sleeps(), 0);
    }

    #[test]
    fn busy_forever_is_bounded_by_time() {
        let clock = ManualClock::default();
        let policy = RetryPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(95),
            max_attempts: u32::MAX,
            exponential: false,
        };

        let err = policy.run(&clock, |_| Attempt::<()>::Busy).unwrap_err();
        assert_eq!(err.attempts, 11);
        assert!(err.elapsed >= policy.timeout);
    }

    #[test]
    fn again_forever_is_bounded_by_attempts() {
        let clock = ManualClock::default();
        let err = RetryPolicy::SYNC
            .run(&clock, |_| Attempt::<()>::Again)
            .unwrap_err();

        assert_eq!(err.attempts, RetryPolicy::SYNC.max_attempts);
        assert_eq!(err.elapsed, Duration::ZERO);
    }

    #[test]
    fn exponential_back_off() {
        let clock = ManualClock::default();
        let policy = RetryPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
            max_attempts: 100,
            exponential: true,
        };

        let res = policy.run(&clock, |attempt| {
            if attempt < 4 {
                Attempt::Busy
            } else {
                Attempt::Done(())
            }
        });

        assert_eq!(res, Ok(()));
        // 1 + 2 + 4 + 8 ms.
        assert_eq!(clock.now(), Duration::from_millis(15));
    }
}
