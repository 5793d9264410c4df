use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Whether a failure may succeed if the same call is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Fatal,
}

/// Errors that know their own retry class.
pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

/// Outcome of one attempt as seen by the retry loop.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Retryable(E),
    Fatal(E),
}

impl<T, E: Classify> From<Result<T, E>> for Attempt<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) => match e.failure_class() {
                FailureClass::Transient => Attempt::Retryable(e),
                FailureClass::Fatal => Attempt::Fatal(e),
            },
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    counter: Option<&'static str>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            counter: None,
        }
    }

    /// Count every retry in the named metrics counter.
    pub fn with_counter(mut self, name: &'static str) -> Self {
        self.counter = Some(name);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept before `attempt` (1-based). The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `f` until it is done, fails fatally or runs out of attempts.
    pub async fn run_classified<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Attempt::Done(value) => {
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Attempt::Fatal(e) => {
                    warn!(operation, attempt, error = %e, "Operation failed with non-retryable error");
                    return Err(e);
                }
                Attempt::Retryable(e) if attempt >= self.max_attempts => {
                    warn!(operation, attempts = attempt, error = %e, "Operation failed after max attempts");
                    return Err(e);
                }
                Attempt::Retryable(e) => {
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    if let Some(name) = self.counter {
                        metrics::counter!(name, "operation" => operation.to_string()).increment(1);
                    }
                    sleep(delay).await;
                }
            }
        }
    }

    /// Like [`run_classified`](Self::run_classified) for errors that classify themselves.
    pub async fn run<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        self.run_classified(operation, || {
            let fut = f();
            async move { Attempt::from(fut.await) }
        })
        .await
    }
}
