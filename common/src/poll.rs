// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition with a bounded timeout.
//!
//! Used where no direct notification exists for an observable event: the
//! moment `pg_ctl start` leaves a server able to accept connections, or
//! the moment a promoted standby exits recovery.

use std::future::Future;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Result of one attempt to check a condition (see [`wait_for_condition()`])
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// Result of [`wait_for_condition()`]
#[derive(Debug, Error)]
pub enum Error<E> {
    /// operation timed out before succeeding or failing permanently
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition: {0}")]
    PermanentError(E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// a given time has expired.
///
/// Note that `poll_max` is not a bound on how long this function can take.
/// Rather, it's the time beyond which this function will stop trying to
/// check `cond`.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        let check = cond().await;
        if let Ok(output) = check {
            return Ok(output);
        }

        if let Err(CondCheckError::Failed(e)) = check {
            return Err(Error::PermanentError(e));
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_once_condition_holds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Error<anyhow::Error>> = wait_for_condition(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CondCheckError::NotYet)
                } else {
                    Ok(42)
                }
            },
            &Duration::from_millis(1),
            &Duration::from_secs(5),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let result: Result<(), Error<anyhow::Error>> = wait_for_condition(
            || async {
                Err(CondCheckError::Failed(anyhow::anyhow!("nope")))
            },
            &Duration::from_millis(1),
            &Duration::from_secs(5),
        )
        .await;
        match result {
            Err(Error::PermanentError(e)) => {
                assert_eq!(e.to_string(), "nope")
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn times_out() {
        let result: Result<(), Error<anyhow::Error>> = wait_for_condition(
            || async { Err(CondCheckError::NotYet) },
            &Duration::from_millis(1),
            &Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(Error::TimedOut(_))));
    }
}
