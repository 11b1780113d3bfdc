use std::fmt::Display;
use tracing::warn;

/// Retry an async operation with linear backoff.
///
/// Calls `f` up to `max_attempts` times. An error for which `is_transient`
/// returns false is returned immediately. Otherwise waits 500ms * attempt
/// before retrying. Returns the first successful result, or the last error.
///
/// Meant for batch clients retrying a whole logical operation (e.g. a week
/// import that rolled itself back); storage components never retry internally.
pub async fn retry_with_backoff<F, Fut, T, E>(
    max_attempts: u32,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    f: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    label, attempt, max_attempts, e
                );
                tokio::time::sleep(std::time::Duration::from_millis(500 * attempt as u64)).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!("{} failed after {} attempts", label, attempt);
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            3,
            "flaky",
            |_| true,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            5,
            "permanent",
            |e: &String| e != "duplicate",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("duplicate".to_string())
            },
        )
        .await;

        assert_eq!(result, Err("duplicate".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            2,
            "down",
            |_| true,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("unavailable".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
