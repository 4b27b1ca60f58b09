//! Cancellation scopes with a deadline
//!
//! A [`CancelScope`] is shared by every party in one bootstrap phase: the
//! background manifest applier, the readiness poll and the orchestrator. Any of
//! them can end the scope early with [`CancelScope::cancel`]; otherwise it ends
//! when its deadline passes. Whichever happens first is remembered as the
//! scope's [`DoneCause`], so a failure observed after the scope ended can be
//! told apart from a real one.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Why a scope ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoneCause {
    /// [`CancelScope::cancel`] was called
    Cancelled,
    /// The deadline passed
    DeadlineExceeded,
}

#[derive(Debug)]
struct Inner {
    name: String,
    timeout: Duration,
    deadline: Instant,
    token: CancellationToken,
    cause: OnceLock<DoneCause>,
}

/// A cloneable cancellation token bounded by a deadline
#[derive(Clone, Debug)]
pub struct CancelScope {
    inner: Arc<Inner>,
}

impl CancelScope {
    /// Create a scope named `name` that ends `timeout` from now
    pub fn with_timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                timeout,
                deadline: Instant::now() + timeout,
                token: CancellationToken::new(),
                cause: OnceLock::new(),
            }),
        }
    }

    /// Name used in errors and logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configured window
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// End the scope now. A scope that already ended keeps its first cause.
    pub fn cancel(&self) {
        self.record_deadline_if_passed();
        if self.inner.cause.set(DoneCause::Cancelled).is_ok() {
            trace!(scope = %self.inner.name, "scope cancelled");
        }
        self.inner.token.cancel();
    }

    /// Whether the scope has ended for any reason
    pub fn is_done(&self) -> bool {
        self.cause().is_some()
    }

    /// The first reason the scope ended, or `None` while it is still live
    pub fn cause(&self) -> Option<DoneCause> {
        self.record_deadline_if_passed();
        self.inner.cause.get().copied()
    }

    /// Resolves once the scope has ended
    pub async fn done(&self) {
        tokio::select! {
            _ = self.inner.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.inner.deadline) => {
                let _ = self.inner.cause.set(DoneCause::DeadlineExceeded);
                self.inner.token.cancel();
            }
        }
    }

    /// The error describing why the scope ended, if it has
    pub fn err(&self) -> Option<Error> {
        self.cause().map(|cause| match cause {
            DoneCause::Cancelled => Error::cancelled(self.inner.name.clone()),
            DoneCause::DeadlineExceeded => {
                Error::deadline_exceeded(self.inner.name.clone(), self.inner.timeout)
            }
        })
    }

    fn record_deadline_if_passed(&self) {
        if Instant::now() >= self.inner.deadline {
            let _ = self.inner.cause.set(DoneCause::DeadlineExceeded);
            self.inner.token.cancel();
        }
    }
}

/// Poll `check` immediately and then every `interval` until it returns
/// `Ok(true)` or the scope ends.
///
/// Errors from `check` are returned as-is; callers that treat read failures
/// as transient swallow them inside `check`. When the scope ends first the
/// scope's own error ([`Error::Cancelled`] or [`Error::DeadlineExceeded`]) is
/// returned.
pub async fn poll_until_done<F, Fut>(
    scope: &CancelScope,
    interval: Duration,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    loop {
        if let Some(err) = scope.err() {
            return Err(err);
        }

        if check().await? {
            return Ok(());
        }

        tokio::select! {
            _ = scope.done() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Run `fut` to completion unless the scope ends first.
///
/// `fut` is dropped when the scope ends and the scope's error is returned,
/// so a request stalled on an unresponsive server cannot outlive the scope.
pub async fn run_until_done<F, T>(scope: &CancelScope, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = scope.done() => Err(scope
            .err()
            .unwrap_or_else(|| Error::cancelled(scope.name()))),
        result = fut => result,
    }
}
