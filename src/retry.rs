//! Support utilities for [`keen_retry`]'s retry API.
//!
//! Adapters report each attempt as a [`RetryResult`], which lets them mark
//! failures as transient or fatal. [`with_retries`] then decides whether to
//! try again.

use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use reqwest::StatusCode;

use crate::prelude::*;

/// A [`RetryResult`] for a single adapter call.
pub type AttemptResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use {try_fatal, try_potentially_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
#[allow(dead_code)]
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Build an [`RetryResult::Transient`] value.
#[allow(dead_code)]
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Run `attempt`, retrying transient failures up to `retries` more times with
/// exponential backoff.
///
/// With `retries == 0`, transient failures are reported like fatal ones.
pub async fn with_retries<T, F, Fut>(retries: u8, attempt: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = AttemptResult<T>>,
{
    if retries == 0 {
        return match attempt().await {
            RetryResult::Ok { output, .. } => Ok(output),
            RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                Err(error)
            }
        };
    }

    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 1..=30_000,
        re_attempts: retries.into(),
        jitter_ratio: 0.2,
    };
    let resolved = attempt()
        .await
        .retry_with_async(|_| attempt())
        .with_exponential_jitter(|| jitter)
        .await;
    match resolved {
        ResolvedResult::Ok { output, .. } => Ok(output),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => {
            warn!(
                "succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => Err(fatal_error.context(format!(
            "failed after {} retries (earlier failures: [{}])",
            retry_errors.len(),
            keen_retry::loggable_retry_errors(&retry_errors)
        ))),
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, timeouts and the like. `reqwest` doesn't
            // expose enough detail to tell them apart.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}
