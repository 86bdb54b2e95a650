// Copyright (C) 2022 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::fmt::Display;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tracing::warn;

pub use backoff::Error as RetryError;

/// Retries `operation` with exponential backoff until it succeeds, returns a
/// permanent error, or `max_elapsed` is exhausted.
///
/// The operation classifies its own failures: `RetryError::transient` failures
/// are retried, `RetryError::permanent` failures are returned immediately.
pub fn retry_with_backoff<T, E, F>(label: &str, max_elapsed: Duration, operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, RetryError<E>>,
{
    let backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };
    let label = label.to_string();
    backoff::retry_notify(backoff, operation, |error, wait| {
        warn!(operation = %label, error = %error, wait = ?wait, "Transient failure, retrying.");
    })
    .map_err(|error| match error {
        RetryError::Permanent(error) => error,
        RetryError::Transient { err, .. } => err,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_retry_eventually_succeeds() {
        let mut num_attempts = 0;
        let result: Result<u32, &str> =
            retry_with_backoff("test-op", Duration::from_secs(10), || {
                num_attempts += 1;
                if num_attempts < 3 {
                    Err(RetryError::transient("not yet"))
                } else {
                    Ok(42)
                }
            });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(num_attempts, 3);
    }

    #[test]
    fn test_retry_permanent_error_short_circuits() {
        let mut num_attempts = 0;
        let result: Result<u32, &str> =
            retry_with_backoff("test-op", Duration::from_secs(10), || {
                num_attempts += 1;
                Err(RetryError::permanent("no"))
            });
        assert_eq!(result.unwrap_err(), "no");
        assert_eq!(num_attempts, 1);
    }
}
