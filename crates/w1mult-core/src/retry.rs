use log::{debug, warn};

use crate::status::W1Error;

/// Attempts made by every verified register operation.
pub const MAX_TRIES: usize = 4;

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or
/// [`MAX_TRIES`] attempts have been made. The closure receives the attempt
/// number, starting at 0.
///
/// # Errors
///
/// The first non-retryable error, or the last retryable one once the
/// attempts are used up.
pub fn with_retries<T, F>(what: &str, mut attempt: F) -> Result<T, W1Error>
where
    F: FnMut(usize) -> Result<T, W1Error>,
{
    let mut tries = 0;
    loop {
        match attempt(tries) {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() => {
                tries += 1;
                if tries >= MAX_TRIES {
                    warn!(target: "w1mult::bus", "{what} failed {tries} times: {error}");
                    return Err(error);
                }
                debug!(target: "w1mult::bus", "{what} attempt {tries} failed: {error}");
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{with_retries, MAX_TRIES};
    use crate::status::W1Error;

    #[test]
    fn succeeds_on_the_last_allowed_attempt() {
        let mut calls = 0;
        let result = with_retries("write", |attempt| {
            calls += 1;
            if attempt + 1 < MAX_TRIES {
                Err(W1Error::CrcError)
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result, Ok(MAX_TRIES - 1));
        assert_eq!(calls, MAX_TRIES);
    }

    #[test]
    fn stops_after_the_bound_with_the_last_error() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries("write", |_| {
            calls += 1;
            Err(W1Error::BusError)
        });
        assert_eq!(result, Err(W1Error::BusError));
        assert_eq!(calls, MAX_TRIES);
    }

    #[test]
    fn non_retryable_errors_are_returned_at_once() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries("write", |_| {
            calls += 1;
            Err(W1Error::NoDevicePresent)
        });
        assert_eq!(result, Err(W1Error::NoDevicePresent));
        assert_eq!(calls, 1);
    }
}
