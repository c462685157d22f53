// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.
//!
//! These retry policies should be used when attempting to access some
//! loosely-coupled component which may transiently fail:
//! - the monitor, while it restarts or fails over itself
//! - the local Postgres instance, while it starts up or recovers

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for connecting to the monitor.
///
/// This policy makes attempts to retry under one second, but backs off
/// significantly so that a monitor outage does not get hammered by every
/// keeper in the formation at once.
pub fn retry_policy_monitor() -> ::backoff::ExponentialBackoff {
    backoff_builder()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_interval(Duration::from_secs(60))
        .build()
}

/// Return a backoff policy for querying the local Postgres instance.
///
/// This policy has a very small max interval: the request is local to the
/// node and repeating it does not risk overloading anything remote.
pub fn retry_policy_local() -> ::backoff::ExponentialBackoff {
    backoff_builder()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .build()
}

fn backoff_builder() -> ::backoff::ExponentialBackoffBuilder {
    let mut builder = ::backoff::ExponentialBackoffBuilder::new();
    builder.with_multiplier(2.0).with_max_elapsed_time(None);
    builder
}

/// Delay applied before the supervisor restarts a crashed service:
/// `min(2^retries, 32) × base`.  Retries reset once a service stays up
/// long enough (see the supervisor).
pub fn restart_delay(retries: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retries).min(32);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn restart_delay_doubles_then_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(restart_delay(0, base), Duration::from_millis(500));
        assert_eq!(restart_delay(1, base), Duration::from_secs(1));
        assert_eq!(restart_delay(3, base), Duration::from_secs(4));
        assert_eq!(restart_delay(5, base), Duration::from_secs(16));
        // 2^6 = 64 caps at 32
        assert_eq!(restart_delay(6, base), Duration::from_secs(16));
        assert_eq!(restart_delay(31, base), Duration::from_secs(16));
        // no overflow on absurd retry counts
        assert_eq!(restart_delay(u32::MAX, base), Duration::from_secs(16));
    }
}
