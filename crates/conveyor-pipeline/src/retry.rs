//! Bounded retry with linear-capped backoff for stage attempts.

use std::future::Future;
use std::time::Duration;

use conveyor_types::ConveyorError;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// `min(cap, base * attempt)` with 1-based attempts.
    Linear { base: Duration, cap: Duration },
    /// Fixed delay between retries.
    Fixed(Duration),
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Linear { base, cap } => {
                let factor = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(*cap)
            }
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Linear {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(60),
        }
    }
}

/// Engine-wide retry settings; stages may override `max_attempts`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Attempts to allow for a stage, honoring its override.
    pub fn attempts_for(&self, stage_override: Option<usize>) -> usize {
        stage_override.unwrap_or(self.max_attempts).max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Why a stage gave up.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    /// A critical stage exhausted its attempts; the job halts.
    #[error("Stage '{stage}' failed fatally: {last_error}")]
    Fatal {
        stage: String,
        last_error: ConveyorError,
    },
    /// A non-critical stage exhausted its attempts; the job continues.
    #[error("Stage '{stage}' failed (non-critical): {last_error}")]
    Soft {
        stage: String,
        last_error: ConveyorError,
    },
}

impl StageFailure {
    pub fn stage(&self) -> &str {
        match self {
            StageFailure::Fatal { stage, .. } | StageFailure::Soft { stage, .. } => stage,
        }
    }

    pub fn last_error(&self) -> &ConveyorError {
        match self {
            StageFailure::Fatal { last_error, .. } | StageFailure::Soft { last_error, .. } => {
                last_error
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StageFailure::Fatal { .. })
    }
}

/// Outcome of [`run_with_retry`] together with how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StageFailure>,
    pub attempts: usize,
}

/// Call `f` until it succeeds or `max_attempts` is reached.
///
/// `f` receives the 1-based attempt number. Every error counts as a failed
/// attempt; errors flagged by [`ConveyorError::is_terminal`] stop the loop
/// early. There is no sleep after the last attempt.
pub async fn run_with_retry<T, F, Fut>(
    stage: &str,
    mut f: F,
    max_attempts: usize,
    critical: bool,
    backoff: &BackoffPolicy,
) -> Attempted<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = conveyor_types::Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    let last_error = loop {
        attempt += 1;
        match f(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_terminal() => {
                tracing::warn!(stage = %stage, attempt, error = %e, "Permanent failure, not retrying");
                break e;
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!(stage = %stage, attempt, error = %e, "Attempts exhausted");
                break e;
            }
            Err(e) => {
                let delay = backoff.delay_for_attempt(attempt);
                tracing::warn!(
                    stage = %stage,
                    attempt,
                    max_attempts,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Stage attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    let stage = stage.to_string();
    let failure = if critical {
        StageFailure::Fatal { stage, last_error }
    } else {
        StageFailure::Soft { stage, last_error }
    };
    Attempted {
        result: Err(failure),
        attempts: attempt,
    }
}
