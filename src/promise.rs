//! One-shot resolvable futures.
//!
//! The generic cross-process promise mechanism is an external collaborator;
//! this module realizes the narrow interface the step control consumes:
//! resolve at most once (success, failure, or cancellation), query `done`,
//! and await the outcome from any number of concurrent tasks. The trigger
//! gate is a [`Promise<()>`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::error::{ControlError, Result};

/// Final state of a resolved promise.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Resolved(T),
    Failed(ControlError),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Failed(err) => Err(err),
            Self::Cancelled => Err(ControlError::Cancelled),
        }
    }
}

struct Inner<T> {
    slot: Mutex<Option<Outcome<T>>>,
    resolved_tx: watch::Sender<bool>,
    resolved_rx: watch::Receiver<bool>,
}

/// A one-shot future that can be resolved from any clone and awaited by any
/// number of tasks. The first resolution wins; later attempts return `false`
/// instead of failing, so duplicate resolution can never deadlock or raise.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        let (resolved_tx, resolved_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                resolved_tx,
                resolved_rx,
            }),
        }
    }

    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        // The outcome is in place before waiters observe the flag.
        let _ = self.inner.resolved_tx.send(true);
        true
    }

    /// Resolves with a value. Returns `false` if already resolved.
    pub fn complete(&self, value: T) -> bool {
        self.resolve(Outcome::Resolved(value))
    }

    /// Resolves with a failure. Returns `false` if already resolved.
    pub fn fail(&self, err: ControlError) -> bool {
        self.resolve(Outcome::Failed(err))
    }

    /// Resolves with cancellation. Returns `false` if already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    pub fn done(&self) -> bool {
        *self.inner.resolved_rx.borrow()
    }
}

impl<T: Clone> Promise<T> {
    /// Snapshot of the outcome, if resolved.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Suspends until the promise resolves. Resumes immediately if it
    /// already has.
    pub async fn wait(&self) -> Outcome<T> {
        let mut rx = self.inner.resolved_rx.clone();
        // The sender lives inside `inner`, so the channel cannot close while
        // `self` exists.
        let _ = rx.wait_for(|resolved| *resolved).await;
        self.peek().unwrap_or(Outcome::Cancelled)
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("done", &self.done()).finish()
    }
}
