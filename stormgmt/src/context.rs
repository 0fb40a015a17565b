//! Cancellation-and-deadline token passed to every blocking operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Safety margin subtracted from the caller's budget for each remote call, so
/// the call fails locally before the caller's own deadline fires.
pub const CALL_DEADLINE_MARGIN: Duration = Duration::from_millis(10);

/// Caller-supplied bound on a blocking operation.
///
/// Cancellation and deadline expiry are reported as distinct errors
/// (`Canceled` vs `DeadlineExceeded`). Derived contexts share the parent's
/// cancellation and can only tighten its deadline.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    credentials: Option<Arc<str>>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            credentials: None,
        }
    }

    /// Bind a context to an externally owned cancellation token.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            credentials: None,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            credentials: self.credentials.clone(),
        }
    }

    /// A context that can be canceled without affecting this one.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            credentials: self.credentials.clone(),
        }
    }

    /// Attach a bearer token sent with every remote call.
    pub fn with_credentials(&self, jwt: impl Into<Arc<str>>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            credentials: Some(jwt.into()),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The error this context would abort with now, if any.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::Canceled("context canceled".to_string()));
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Error::DeadlineExceeded(
                "context deadline exceeded".to_string(),
            )),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Budget for a single remote call: the remaining time minus a margin, or
    /// `default` when the caller set no deadline.
    pub fn call_timeout(&self, default: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.saturating_sub(CALL_DEADLINE_MARGIN),
            None => default,
        }
    }

    /// Drive `fut` until it completes, the context is canceled or the
    /// deadline passes, whichever happens first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(Error::Canceled("context canceled".to_string()))
            }
            _ = expired(self.deadline) => {
                Err(Error::DeadlineExceeded("context deadline exceeded".to_string()))
            }
            res = fut => res,
        }
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_reports_deadline() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(20));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn run_reports_cancellation() {
        let ctx = CallContext::background();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move {
            waiter
                .run(std::future::pending::<Result<()>>())
                .await
        });
        ctx.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Canceled(_)));
    }

    #[tokio::test]
    async fn child_cancel_does_not_touch_parent() {
        let parent = CallContext::background();
        let child = parent.child();
        child.cancel();
        assert!(child.err().is_some());
        assert!(parent.err().is_none());
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child() {
        let parent = CallContext::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(matches!(child.err(), Some(Error::Canceled(_))));
    }

    #[tokio::test]
    async fn deadline_only_tightens() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(100));
        let looser = ctx.with_timeout(Duration::from_secs(100));
        assert_eq!(looser.deadline(), ctx.deadline());
    }

    #[tokio::test]
    async fn call_timeout_defaults_without_deadline() {
        let ctx = CallContext::background();
        assert_eq!(ctx.call_timeout(Duration::from_secs(10)), Duration::from_secs(10));
        let ctx = ctx.with_timeout(Duration::from_secs(1));
        assert!(ctx.call_timeout(Duration::from_secs(10)) < Duration::from_secs(1));
    }

    #[test]
    fn credentials_are_inherited() {
        let ctx = CallContext::background().with_credentials("jwt");
        assert_eq!(ctx.child().credentials(), Some("jwt"));
    }
}
