//! Cancellation with a recorded cause
//!
//! A [`CancelToken`] is created once per transfer. Any worker may cancel it
//! with the error that made it give up; the first cause recorded wins and is
//! what the transfer finally reports. Child tokens are cancelled together with
//! their parent, which is how caller-supplied timeouts compose with a
//! transfer's own cancellation.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::error::FerryError;

/// Cooperative cancellation signal carrying the error that triggered it
#[derive(Debug, Clone)]
pub struct CancelToken {
    token: CancellationToken,
    cause: Arc<OnceLock<FerryError>>,
    parent: Option<Box<CancelToken>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// Derive a token that is cancelled when `self` is, but can also be
    /// cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Derive a child token that cancels itself with [`FerryError::Timeout`]
    /// once `timeout` elapses. Must be called from within a tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timer.cancel(FerryError::Timeout(timeout)),
                _ = timer.cancelled() => {}
            }
        });
        child
    }

    /// Cancel with `cause`. Later causes are ignored.
    pub fn cancel(&self, cause: FerryError) {
        if self.cause.set(cause).is_ok() {
            if let Some(cause) = self.cause.get() {
                debug!(%cause, "cancelling");
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The error this token was cancelled with, `None` while still live.
    ///
    /// A token cancelled through its parent reports the parent's cause.
    pub fn cause(&self) -> Option<FerryError> {
        if !self.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }
        match &self.parent {
            Some(parent) => parent.cause(),
            None => Some(FerryError::Cancelled),
        }
    }

    /// The cancellation cause, or [`FerryError::Cancelled`] if none was set
    pub fn error(&self) -> FerryError {
        self.cause().unwrap_or(FerryError::Cancelled)
    }

    /// `Err(cause)` once cancelled
    pub fn check(&self) -> Result<(), FerryError> {
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Guard that cancels this token when dropped
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }
}
