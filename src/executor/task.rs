//! Cancellable task runner
//!
//! Races one unit of work against its timeout and a cancellation signal.
//! A unit that loses the race is dropped, never polled again; whatever it
//! would have produced is ignored.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::watch;

use crate::models::error::panic_message;

/// Cancellation signal, optionally linked to a parent signal
#[derive(Clone, Debug)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            parent: None,
        }
    }

    /// Token that fires when either it or `self` is cancelled
    pub fn child(&self) -> Self {
        Self {
            parent: Some(Box::new(self.clone())),
            ..Self::new()
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once this token or any ancestor is cancelled
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        async move {
            let own = async {
                let mut rx = self.state.subscribe();
                loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Sender lives as long as `self`
                        future::pending::<()>().await;
                    }
                }
            };

            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        }
        .boxed()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// How a unit settled
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Success(T),
    /// The unit returned an error or panicked
    Failure(anyhow::Error),
    TimedOut(Duration),
    /// Cancellation fired before the unit settled, or before it started
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }
}

/// Invoke `unit` once and race it against `timeout` and `cancel`
pub async fn run_task<F, Fut, T>(unit: F, timeout: Duration, cancel: &CancelToken) -> TaskOutcome<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    if cancel.is_cancelled() {
        return TaskOutcome::Cancelled;
    }

    // A panic while building the future counts as a failure of the unit
    let pending = match panic::catch_unwind(AssertUnwindSafe(unit)) {
        Ok(pending) => pending,
        Err(payload) => return TaskOutcome::Failure(anyhow::anyhow!(panic_message(payload))),
    };

    let guarded = AssertUnwindSafe(pending).catch_unwind();

    tokio::select! {
        biased;

        _ = cancel.cancelled() => TaskOutcome::Cancelled,
        settled = guarded => match settled {
            Ok(Ok(value)) => TaskOutcome::Success(value),
            Ok(Err(err)) => TaskOutcome::Failure(err),
            Err(payload) => TaskOutcome::Failure(anyhow::anyhow!(panic_message(payload))),
        },
        _ = tokio::time::sleep(timeout) => TaskOutcome::TimedOut(timeout),
    }
}

/// Task runner bound to one timeout and its own cancel signal
#[derive(Clone, Debug)]
pub struct TaskRunner {
    timeout: Duration,
    cancel: CancelToken,
}

impl TaskRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancelToken::new(),
        }
    }

    /// Runner that is also cancelled by `parent`
    pub fn with_parent(timeout: Duration, parent: &CancelToken) -> Self {
        Self {
            timeout,
            cancel: parent.child(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn run<F, Fut, T>(&self, unit: F) -> TaskOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        run_task(unit, self.timeout, &self.cancel).await
    }
}
