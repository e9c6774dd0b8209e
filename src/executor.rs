use std::future::Future;

use tracing::warn;

use crate::{backend::BackendError, config::RetryPolicy, error::QueueError};

impl RetryPolicy {
    /// Runs `execute` until it succeeds, retrying only when the backend
    /// reports a deadlock. Any other failure is returned at once.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut execute: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = self.attempts.max(1);

        for attempt in 1..=attempts {
            match execute().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_deadlock() => {
                    warn!(operation, attempt, error = %err, "deadlock detected");
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(err) => return Err(QueueError::backend(operation, err)),
            }
        }

        Err(QueueError::DeadlockRetriesExceeded {
            operation,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use tokio::time::Instant;

    use super::*;

    struct Script {
        outcomes: Mutex<VecDeque<Result<u64, BackendError>>>,
        calls: AtomicU32,
    }

    impl Script {
        fn new(outcomes: impl IntoIterator<Item = Result<u64, BackendError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                calls: AtomicU32::new(0),
            }
        }

        async fn next(&self) -> Result<u64, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::deadlock("still deadlocked")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_deadlocks_then_succeeds() {
        let script = Script::new([
            Err(BackendError::deadlock("first")),
            Err(BackendError::deadlock("second")),
            Ok(7),
        ]);
        let started = Instant::now();

        let affected = RetryPolicy::default()
            .run("claim", || script.next())
            .await
            .unwrap();

        assert_eq!(affected, 7);
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert!(started.elapsed() < Duration::from_millis(15));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts() {
        let script = Script::new([]);

        let err = RetryPolicy::default()
            .run("claim", || script.next())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueueError::DeadlockRetriesExceeded {
                operation: "claim",
                attempts: 5
            }
        ));
        assert_eq!(script.calls.load(Ordering::SeqCst), 5);
        assert!(err.to_string().contains("after 5 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let script = Script::new([
            Err(BackendError::new("42S02", "table doesn't exist").with_vendor_code(1146)),
            Ok(1),
        ]);
        let started = Instant::now();

        let err = RetryPolicy::default()
            .run("remove", || script.next())
            .await
            .unwrap_err();

        match err {
            QueueError::Backend {
                operation,
                sqlstate,
                vendor_code,
                message,
            } => {
                assert_eq!(operation, "remove");
                assert_eq!(sqlstate, "42S02");
                assert_eq!(vendor_code, Some(1146));
                assert_eq!(message, "table doesn't exist");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            attempts: 0,
            backoff: Duration::from_millis(5),
        };

        let script = Script::new([Ok(3)]);
        assert_eq!(policy.run("claim", || script.next()).await.unwrap(), 3);
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);

        let script = Script::new([]);
        let err = policy.run("claim", || script.next()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::DeadlockRetriesExceeded { attempts: 1, .. }
        ));
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn postgres_deadlock_code_is_retried() {
        let script = Script::new([Err(BackendError::new("40P01", "deadlock detected")), Ok(0)]);

        let affected = RetryPolicy::default()
            .run("unassign_all", || script.next())
            .await
            .unwrap();

        assert_eq!(affected, 0);
        assert_eq!(script.calls.load(Ordering::SeqCst), 2);
    }
}
