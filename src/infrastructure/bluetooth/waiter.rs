//! One-shot bridge from a transport completion callback to an awaiting step.
//!
//! Every operation gets its own [`Waiter`]/[`Resolver`] pair. The resolver
//! can be cloned into several callbacks (success and failure paths); the
//! first resolution wins and anything after it is dropped silently,
//! including a resolution that arrives after the waiter timed out.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

use super::error::TransportError;

/// Awaiting half, owned by the pipeline step
pub struct Waiter {
    rx: oneshot::Receiver<bool>,
}

/// Resolving half, handed to transport callbacks
#[derive(Clone)]
pub struct Resolver {
    tx: Arc<Mutex<Option<oneshot::Sender<bool>>>>,
}

impl Waiter {
    pub fn new() -> (Waiter, Resolver) {
        let (tx, rx) = oneshot::channel();
        (
            Waiter { rx },
            Resolver {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
        )
    }

    /// Suspend until resolved; `false` on failure, timeout, or a dropped resolver
    pub async fn wait(self, timeout: Duration) -> bool {
        self.outcome(timeout).await == WaitOutcome::Succeeded
    }

    /// Like [`Waiter::wait`], but tells a timeout apart from a failure
    pub async fn outcome(self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(true)) => WaitOutcome::Succeeded,
            Ok(Ok(false)) => WaitOutcome::Failed,
            Ok(Err(_)) => {
                trace!("Waiter abandoned by its resolver");
                WaitOutcome::Failed
            }
            Err(_) => {
                trace!("Waiter timed out after {:?}", timeout);
                WaitOutcome::TimedOut
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl Resolver {
    pub fn succeed(&self) {
        self.resolve(true);
    }

    pub fn fail(&self) {
        self.resolve(false);
    }

    pub fn resolve(&self, outcome: bool) {
        // Sender is taken under the lock but used outside it
        let tx = self.tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }

    /// Resolve from a transport completion result
    pub fn complete(&self, result: &Result<(), TransportError>) {
        self.resolve(result.is_ok());
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.lock().is_none()
    }
}
