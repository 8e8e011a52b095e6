//! Backoff, attempt limits and replay rules.

use std::future::Future;
use std::time::Duration;

use http::Method;
use rand::Rng;
use tokio::time::Instant;
use tracing::warn;

use crate::context::CallContext;
use crate::error::{Error, Result};

/// Backoff and attempt limits for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff ceiling of the first retry.
    pub base_delay: Duration,
    /// No backoff is longer than this.
    pub max_delay: Duration,
    /// Physical attempts per operation, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
            max_attempts: 5,
        }
    }
}

/// Whether a failed attempt can be sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// The body can be produced again and the method is idempotent.
    Replayable,
    /// One attempt only.
    SinglePass,
}

impl Replay {
    /// Replay mode of a request with `method` whose body is (or is not) reproducible.
    pub fn for_request(method: &Method, body_replayable: bool) -> Self {
        let idempotent = matches!(
            *method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
        );
        if idempotent && body_replayable {
            Replay::Replayable
        } else {
            Replay::SinglePass
        }
    }
}

/// Bookkeeping of one logical operation across its attempts.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempts: u32,
    /// When the operation started.
    pub started: Instant,
    /// Kind of the most recent retryable failure.
    pub last_error: Option<&'static str>,
    /// The most recent backoff.
    pub last_delay: Duration,
}

impl RetryState {
    /// Fresh state, started now.
    pub fn new() -> Self {
        Self {
            attempts: 0,
            started: Instant::now(),
            last_error: None,
            last_delay: Duration::ZERO,
        }
    }

    /// Time since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum Decision {
    /// Wait, then try again.
    Retry {
        /// Backoff before the next attempt.
        after: Duration,
    },
    /// Stop and report this error.
    GiveUp(Error),
}

impl RetryPolicy {
    /// Equal-jitter backoff before attempt `attempt + 1`: half of
    /// `min(max_delay, base_delay * 2^(attempt - 1))` plus a random share of the other half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let ceiling = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_nanos()).unwrap_or(u64::MAX);
        half + Duration::from_nanos(rand::thread_rng().gen_range(0..=spread))
    }

    /// Decides on `error` from attempt number `state.attempts`.
    pub fn decide(&self, state: &mut RetryState, error: Error, replay: Replay) -> Decision {
        let failure = match error {
            Error::Retryable(failure) => failure,
            other => return Decision::GiveUp(other),
        };
        state.last_error = Some(failure.kind());

        if replay == Replay::SinglePass || state.attempts >= self.max_attempts {
            return Decision::GiveUp(Error::ExhaustedRetries {
                attempts: state.attempts,
                last: failure,
            });
        }

        let after = self.backoff(state.attempts).max(state.last_delay);
        state.last_delay = after;
        Decision::Retry { after }
    }

    /// Drives `attempt` (called with the 1-based attempt number) until it succeeds or the
    /// policy gives up. A cancelled or expired `ctx` stops the loop, backoff waits included.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &CallContext,
        replay: Replay,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::new();
        loop {
            if ctx.is_done() {
                return Err(Error::Cancelled);
            }
            state.attempts += 1;
            let err = match attempt(state.attempts).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let reason = err.to_string();

            match self.decide(&mut state, err, replay) {
                Decision::GiveUp(err) => return Err(err),
                Decision::Retry { after } => {
                    warn!(
                        attempt = state.attempts,
                        delay_ms = after.as_millis() as u64,
                        elapsed_ms = state.elapsed().as_millis() as u64,
                        error = %reason,
                        "retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.done() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(after) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::{Failure, ServiceError};

    fn unavailable() -> Error {
        Error::Retryable(Failure::Service(ServiceError {
            status: 503,
            code: "ServiceUnavailable".into(),
            message: String::new(),
            resource: None,
            request_id: None,
        }))
    }

    #[test]
    fn backoff_stays_within_its_window() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let first = policy.backoff(1);
            assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(200));
            let late = policy.backoff(20);
            assert!(late >= Duration::from_secs(10) && late <= Duration::from_secs(20));
        }
    }

    #[test]
    fn delays_never_shrink_and_stay_capped() {
        let policy = RetryPolicy {
            max_attempts: 40,
            ..RetryPolicy::default()
        };
        let mut state = RetryState::new();
        let mut previous = Duration::ZERO;
        for _ in 1..40 {
            state.attempts += 1;
            match policy.decide(&mut state, unavailable(), Replay::Replayable) {
                Decision::Retry { after } => {
                    assert!(after >= previous);
                    assert!(after <= policy.max_delay);
                    previous = after;
                }
                Decision::GiveUp(err) => panic!("gave up early: {err}"),
            }
        }
        assert_eq!(state.last_error, Some("service"));
    }

    #[tokio::test(start_paused = true)]
    async fn four_failures_then_success_takes_five_attempts() {
        let policy = RetryPolicy::default();
        let started = Instant::now();

        let value = policy
            .run(&CallContext::new(), Replay::Replayable, |n| async move {
                if n < 5 { Err(unavailable()) } else { Ok(n) }
            })
            .await
            .unwrap();

        assert_eq!(value, 5);
        // Four waits of at least half their ceiling: 100 + 200 + 400 + 800 ms.
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(started.elapsed() <= Duration::from_secs(80));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_wraps_the_last_failure() {
        let policy = RetryPolicy::default();
        let err = policy
            .run(&CallContext::new(), Replay::Replayable, |_| async {
                Err::<(), _>(Error::Retryable(Failure::Timeout))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ExhaustedRetries {
                attempts: 5,
                last: Failure::Timeout
            }
        ));
    }

    #[tokio::test]
    async fn single_pass_requests_get_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = RetryPolicy::default()
            .run(&CallContext::new(), Replay::SinglePass, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unavailable()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::ExhaustedRetries { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn terminal_and_cancelled_errors_are_returned_unchanged() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = policy
            .run(&CallContext::new(), Replay::Replayable, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Terminal(Failure::Malformed("bad".into()))) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Terminal(Failure::Malformed(_))));

        let counter = calls.clone();
        let err = policy
            .run(&CallContext::new(), Replay::Replayable, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Cancelled) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff_wait() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        let ctx = CallContext::new();
        let handle = ctx.clone();
        let started = Instant::now();

        let err = policy
            .run(&ctx, Replay::Replayable, move |_| {
                handle.cancel();
                async { Err::<(), _>(unavailable()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn only_idempotent_methods_replay() {
        assert_eq!(Replay::for_request(&Method::PUT, true), Replay::Replayable);
        assert_eq!(Replay::for_request(&Method::PUT, false), Replay::SinglePass);
        assert_eq!(Replay::for_request(&Method::POST, true), Replay::SinglePass);
        assert_eq!(Replay::for_request(&Method::GET, true), Replay::Replayable);
    }
}
