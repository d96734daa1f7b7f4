//! Cancellation tokens and the first-to-fire combiner
//!
//! A [`CancelToken`] fires at most once and remembers why. [`combine`] merges
//! tokens and timeouts into one token that fires with the reason of whichever
//! source fires first.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{select_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a cancellation source fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A configured timeout elapsed
    Timeout(Duration),
    /// An external token was cancelled, optionally with a message
    Requested(Option<String>),
}

impl CancelReason {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Requested(Some(message)) => write!(f, "cancelled: {message}"),
            Self::Requested(None) => f.write_str("cancelled"),
        }
    }
}

/// Cloneable one-shot cancellation token carrying its trigger reason
#[derive(Clone, Default)]
pub struct CancelToken {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel without a message. Returns false if already cancelled.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Requested(None))
    }

    /// Cancel with a caller-supplied message
    pub fn cancel_with_message(&self, message: impl Into<String>) -> bool {
        self.cancel_with(CancelReason::Requested(Some(message.into())))
    }

    /// Cancel with an explicit reason. Only the first call has any effect.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() || self.token.is_cancelled() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason of the first cancellation, if any.
    ///
    /// A wrapped [`CancellationToken`] cancelled directly reports
    /// `Requested(None)`.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(
            self.reason
                .lock()
                .clone()
                .unwrap_or(CancelReason::Requested(None)),
        )
    }

    /// Wait until the token fires and return its reason
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        self.reason()
            .unwrap_or(CancelReason::Requested(None))
    }

    /// The underlying token, for APIs that take a [`CancellationToken`]
    pub fn as_cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

impl From<CancellationToken> for CancelToken {
    fn from(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::default(),
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// One input to [`combine`]
#[derive(Debug, Clone)]
pub enum CancelSource {
    Token(CancelToken),
    Timeout(Duration),
}

impl From<CancelToken> for CancelSource {
    fn from(token: CancelToken) -> Self {
        Self::Token(token)
    }
}

impl From<Duration> for CancelSource {
    fn from(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

/// Result of [`combine`]: the merged token plus the task watching the inputs.
///
/// Dropping it stops watching the inputs.
#[derive(Debug)]
pub struct CombinedCancel {
    token: CancelToken,
    watcher: Option<JoinHandle<()>>,
}

impl CombinedCancel {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Whether input sources are still being observed
    pub fn is_watching(&self) -> bool {
        self.watcher
            .as_ref()
            .is_some_and(|watcher| !watcher.is_finished())
    }

    fn settled(token: CancelToken, reason: CancelReason) -> Self {
        debug!(reason = %reason, "Cancellation source already triggered");
        token.cancel_with(reason);
        Self {
            token,
            watcher: None,
        }
    }
}

impl Drop for CombinedCancel {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Merge cancellation sources, first to fire wins.
///
/// A token that is already cancelled (or a zero timeout) settles the result
/// immediately and no other source is observed. Otherwise a watcher task is
/// spawned on the current Tokio runtime; it stops observing every source as
/// soon as one fires.
pub fn combine<I>(sources: I) -> CombinedCancel
where
    I: IntoIterator,
    I::Item: Into<CancelSource>,
{
    let token = CancelToken::new();
    let mut pending: Vec<BoxFuture<'static, CancelReason>> = Vec::new();

    for source in sources {
        match source.into() {
            CancelSource::Token(input) => {
                if let Some(reason) = input.reason() {
                    return CombinedCancel::settled(token, reason);
                }
                pending.push(async move { input.cancelled().await }.boxed());
            }
            CancelSource::Timeout(after) => {
                if after.is_zero() {
                    return CombinedCancel::settled(token, CancelReason::Timeout(after));
                }
                pending.push(
                    async move {
                        tokio::time::sleep(after).await;
                        CancelReason::Timeout(after)
                    }
                    .boxed(),
                );
            }
        }
    }

    if pending.is_empty() {
        return CombinedCancel {
            token,
            watcher: None,
        };
    }

    let combined = token.clone();
    let watcher = tokio::spawn(async move {
        let (reason, index, rest) = select_all(pending).await;
        drop(rest);
        debug!(source = index, reason = %reason, "Cancellation source fired");
        combined.cancel_with(reason);
    });

    CombinedCancel {
        token,
        watcher: Some(watcher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_first_wins() {
        let token = CancelToken::new();
        assert!(token.cancel_with_message("first"));
        assert!(!token.cancel());
        assert_eq!(
            token.reason(),
            Some(CancelReason::Requested(Some("first".to_string())))
        );
    }

    #[tokio::test]
    async fn test_already_triggered_source_settles_immediately() {
        let pending_a = CancelToken::new();
        let fired = CancelToken::new();
        fired.cancel_with_message("stop");
        let pending_b = CancelToken::new();

        let combined = combine([
            CancelSource::Token(pending_a.clone()),
            CancelSource::Token(fired),
            CancelSource::Token(pending_b.clone()),
            CancelSource::Timeout(Duration::from_secs(60)),
        ]);

        assert!(!combined.is_watching());
        assert_eq!(
            combined.token().reason(),
            Some(CancelReason::Requested(Some("stop".to_string())))
        );

        // nothing observes the remaining sources
        pending_a.cancel_with_message("late");
        tokio::task::yield_now().await;
        assert_eq!(
            combined.token().reason(),
            Some(CancelReason::Requested(Some("stop".to_string())))
        );
    }

    #[tokio::test]
    async fn test_first_pending_source_wins() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        let combined = combine([a.clone(), b.clone()]);
        assert!(!combined.token().is_cancelled());

        b.cancel_with_message("b");
        let reason = combined.token().cancelled().await;
        assert_eq!(reason, CancelReason::Requested(Some("b".to_string())));

        a.cancel_with_message("a");
        tokio::task::yield_now().await;
        assert_eq!(combined.token().reason(), Some(reason));
    }

    #[tokio::test]
    async fn test_watcher_stops_after_fire() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        let combined = combine([a.clone(), b.clone()]);
        assert!(combined.is_watching());

        a.cancel();
        combined.token().cancelled().await;
        while combined.is_watching() {
            tokio::task::yield_now().await;
        }
        assert!(!b.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_stops_watching() {
        let a = CancelToken::new();
        let combined = combine([a.clone()]);
        let merged = combined.token().clone();
        drop(combined);

        a.cancel();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!merged.is_cancelled());
    }

    #[tokio::test]
    async fn test_wrapped_token_reports_plain_cancel() {
        let inner = CancellationToken::new();
        let token = CancelToken::from(inner.clone());
        let combined = combine([token.clone()]);

        inner.cancel();
        assert_eq!(token.reason(), Some(CancelReason::Requested(None)));
        assert_eq!(
            combined.token().cancelled().await,
            CancelReason::Requested(None)
        );
        assert!(!token.cancel_with_message("too late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_source_reports_timeout() {
        let external = CancelToken::new();
        let combined = combine([
            CancelSource::Token(external.clone()),
            CancelSource::Timeout(Duration::from_millis(100)),
        ]);

        let reason = combined.token().cancelled().await;
        assert!(reason.is_timeout());
        assert_eq!(reason, CancelReason::Timeout(Duration::from_millis(100)));
        assert!(!external.is_cancelled());
    }

    #[test]
    fn test_zero_timeout_settles_without_runtime() {
        let combined = combine([CancelSource::Timeout(Duration::ZERO)]);
        assert_eq!(
            combined.token().reason(),
            Some(CancelReason::Timeout(Duration::ZERO))
        );
    }

    #[test]
    fn test_no_sources_never_fires() {
        let combined = combine(Vec::<CancelSource>::new());
        assert!(!combined.is_watching());
        assert!(!combined.token().is_cancelled());
    }
}
