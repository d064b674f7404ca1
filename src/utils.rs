//! Small shared helpers: clock, nonces, retry policy, cancellation.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default retry policy: 5 attempts, 500 ms base delay, exponential backoff.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Current wall-clock time in UNIX milliseconds.
pub fn now_millis() -> u64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as u64
}

/// A fresh 128-bit random nonce, hex encoded (32 chars).
///
/// Used to disambiguate swap identifiers when the same commitment is quoted
/// from multiple LPs.
pub fn random_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Retry `op` with exponential backoff.
///
/// `should_abort` short-circuits the loop: when it returns `true` for an
/// error, that error is surfaced immediately without further attempts. The
/// LP flows abort on [`Error::Intermediary`]; the price oracle aborts on
/// [`Error::Request`].
pub async fn retry_with_backoff<T, F, Fut>(
    mut op: F,
    should_abort: impl Fn(&Error) -> bool,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if should_abort(&e) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_RETRY_ATTEMPTS {
                    return Err(e);
                }
                log::debug!("retrying after error (attempt {}): {}", attempt, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

/// Run `fut` unless `cancel` fires first; cancellation rejects with the
/// provided reason.
pub async fn cancellable<T>(
    fut: impl Future<Output = Result<T>>,
    cancel: Option<&CancelHandle>,
) -> Result<T> {
    match cancel {
        None => fut.await,
        Some(handle) => {
            tokio::select! {
                biased;
                _ = handle.token.cancelled() => Err(Error::Cancelled(handle.reason())),
                res = fut => res,
            }
        }
    }
}

/// Sleep that can be interrupted by cancellation.
pub async fn cancellable_sleep(duration: Duration, cancel: Option<&CancelHandle>) -> Result<()> {
    cancellable(
        async {
            tokio::time::sleep(duration).await;
            Ok(())
        },
        cancel,
    )
    .await
}

/// A cancellation handle carrying a reason.
///
/// Handles compose: [`CancelHandle::child`] derives a handle that fires when
/// the parent fires, so a resolved waiter can abort its sibling waiters.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: std::sync::Arc<std::sync::Mutex<String>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: std::sync::Arc::new(std::sync::Mutex::new("cancelled".to_string())),
        }
    }

    /// Derive a child handle that also fires when this one does.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: self.reason.clone(),
        }
    }

    /// Cancel with the given reason; waiters reject with exactly this reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = reason.into();
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> String {
        self.reason
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| "cancelled".to_string())
    }

    /// Resolve once cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_aborts_on_predicate() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let res: Result<()> = retry_with_backoff(
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Intermediary("bad total".into()))
                }
            },
            |e| matches!(e, Error::Intermediary(_)),
        )
        .await;
        assert!(matches!(res, Err(Error::Intermediary(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let res: Result<()> = retry_with_backoff(
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Request("503".into()))
                }
            },
            |_| false,
        )
        .await;
        assert!(matches!(res, Err(Error::Request(_))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_cancellable_returns_reason() {
        let handle = CancelHandle::new();
        let child = handle.child();
        handle.cancel("watchdog resolved first");
        let res: Result<()> = cancellable(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            Some(&child),
        )
        .await;
        match res {
            Err(Error::Cancelled(reason)) => assert_eq!(reason, "watchdog resolved first"),
            other => panic!("expected cancellation, got {:?}", other.err()),
        }
    }
}
