use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often, and how far apart, a filesystem operation is attempted before
/// giving up. Directory creation races with concurrent jobs creating the same
/// fan-out directories, so failures are expected to be transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts including the first one; never less than one.
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(10, Duration::from_secs(5))
    }
}

impl RetryConfig {
    pub fn fixed(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            pause,
        }
    }
}

/// Runs `operation` until it succeeds or the attempts run out. On exhaustion
/// returns the last error and the number of attempts made.
pub async fn retry<F, Fut, T, E>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "{} succeeded after retry", what);
                }
                return Ok(value);
            }
            Err(error) if attempt >= config.max_attempts => {
                warn!(attempts = attempt, error = %error, "{} failed, giving up", what);
                return Err((error, attempt));
            }
            Err(error) => {
                warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %error,
                    "{} failed, retrying in {:?}",
                    what,
                    config.pause
                );
                sleep(config.pause).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let config = RetryConfig::fixed(5, Duration::from_millis(1));

        let result = retry(&config, "flaky", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(io::Error::other("busy"))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.ok(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let config = RetryConfig::fixed(3, Duration::ZERO);

        let result = retry(&config, "broken", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(io::Error::other("still broken"))
        })
        .await;

        let (error, attempts) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert_eq!(error.to_string(), "still broken");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryConfig::fixed(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryConfig::default().max_attempts, 10);
        assert_eq!(RetryConfig::default().pause, Duration::from_secs(5));
    }
}
