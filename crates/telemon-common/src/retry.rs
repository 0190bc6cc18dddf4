use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Backoff schedule shared by the HTTP sender and the relational backend.
/// One attempt per entry; each failed attempt waits its entry's delay.
pub const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// Runs `op` once per entry of `schedule` until it succeeds or fails with an
/// error that `is_retryable` rejects.
///
/// A retryable failure is followed by the entry's delay, including the last
/// one, so exhausting [`BACKOFF`] costs three attempts and 9s of waiting.
/// Once the schedule is used up the error of the first attempt is returned;
/// a non-retryable error is returned as soon as it occurs. An empty schedule
/// means a single attempt.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    schedule: &[Duration],
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut first: Option<E> = None;
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !is_retryable(&err) {
            return Err(err);
        }
        let Some(delay) = schedule.get(attempt - 1) else {
            return Err(first.unwrap_or(err));
        };
        tracing::warn!(
            attempt,
            max_attempts = schedule.len(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );
        tokio::time::sleep(*delay).await;
        let original = first.take().unwrap_or(err);
        if attempt >= schedule.len() {
            return Err(original);
        }
        first = Some(original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
        Attempt(usize),
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn transient(e: &TestError) -> bool {
        matches!(e, TestError::Transient | TestError::Attempt(_))
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_schedule_after_nine_seconds() {
        let calls = &AtomicUsize::new(0);
        let start = Instant::now();
        let res: Result<(), _> = retry_with_backoff(&BACKOFF, transient, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Transient)
        })
        .await;
        assert!(matches!(res, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(9) && waited < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = &AtomicUsize::new(0);
        let start = Instant::now();
        let res: Result<(), _> = retry_with_backoff(&BACKOFF, transient, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Fatal)
        })
        .await;
        assert!(matches!(res, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_second_attempt() {
        let calls = &AtomicUsize::new(0);
        let start = Instant::now();
        let res = retry_with_backoff(&BACKOFF, transient, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TestError::Transient)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_the_first_error() {
        let calls = &AtomicUsize::new(0);
        let res: Result<(), _> = retry_with_backoff(&BACKOFF, transient, || async move {
            Err(TestError::Attempt(calls.fetch_add(1, Ordering::SeqCst) + 1))
        })
        .await;
        assert!(matches!(res, Err(TestError::Attempt(1))), "{res:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
