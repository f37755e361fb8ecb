//! Queue runner
//!
//! Runs an ordered list of units one at a time. A failing unit never stops
//! the queue; cancelling it stops any unit that has not started yet.

use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use super::task::{run_task, CancelToken, TaskOutcome};

type UnitFn<C, T> = Box<dyn FnOnce(C) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// One queued unit and its deadline
pub struct QueueUnit<C, T> {
    pub name: String,
    pub timeout: Duration,
    run: UnitFn<C, T>,
}

impl<C, T> QueueUnit<C, T> {
    pub fn new<F, Fut>(name: impl Into<String>, timeout: Duration, f: F) -> Self
    where
        F: FnOnce(C) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout,
            run: Box::new(move |ctx| f(ctx).boxed()),
        }
    }
}

/// Progress notifications while the queue runs
#[derive(Debug)]
pub enum QueueStep<'a, T> {
    Starting {
        index: usize,
        name: &'a str,
    },
    Settled {
        index: usize,
        name: &'a str,
        outcome: &'a TaskOutcome<T>,
    },
}

/// Everything the queue produced
#[derive(Debug)]
pub struct QueueReport<T> {
    /// One entry per unit that was reached, in queue order
    pub outcomes: Vec<(String, TaskOutcome<T>)>,
    pub cancelled: bool,
}

impl<T> QueueReport<T> {
    pub fn failures(&self) -> impl Iterator<Item = (&str, &TaskOutcome<T>)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| {
                matches!(outcome, TaskOutcome::Failure(_) | TaskOutcome::TimedOut(_))
            })
            .map(|(name, outcome)| (name.as_str(), outcome))
    }

    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.failures().next().is_none()
    }
}

/// Sequential runner sharing one context between its units
pub struct QueueRunner<C, T> {
    units: Vec<QueueUnit<C, T>>,
    context: C,
    cancel: CancelToken,
}

impl<C, T> QueueRunner<C, T>
where
    C: Clone + Send,
    T: Send,
{
    pub fn new(context: C) -> Self {
        Self {
            units: Vec::new(),
            context,
            cancel: CancelToken::new(),
        }
    }

    /// Queue that is also stopped by a run-level token
    pub fn with_parent(context: C, parent: &CancelToken) -> Self {
        Self {
            units: Vec::new(),
            context,
            cancel: parent.child(),
        }
    }

    pub fn push(&mut self, unit: QueueUnit<C, T>) {
        self.units.push(unit);
    }

    pub fn with_unit(mut self, unit: QueueUnit<C, T>) -> Self {
        self.push(unit);
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> QueueReport<T> {
        self.run_with(|_| {}).await
    }

    /// Run all units, reporting each start and settlement to `observe`
    pub async fn run_with<O>(self, mut observe: O) -> QueueReport<T>
    where
        O: FnMut(QueueStep<'_, T>) + Send,
    {
        let Self {
            units,
            context,
            cancel,
        } = self;

        let mut outcomes = Vec::with_capacity(units.len());

        for (index, unit) in units.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("Queue cancelled before \"{}\"", unit.name);
                return QueueReport {
                    outcomes,
                    cancelled: true,
                };
            }

            observe(QueueStep::Starting {
                index,
                name: &unit.name,
            });

            let QueueUnit { name, timeout, run } = unit;
            let ctx = context.clone();
            let outcome = run_task(move || run(ctx), timeout, &cancel).await;

            match &outcome {
                TaskOutcome::TimedOut(limit) => {
                    warn!("\"{}\" timed out after {}ms", name, limit.as_millis())
                }
                TaskOutcome::Failure(err) => debug!("\"{}\" failed: {:#}", name, err),
                _ => {}
            }

            observe(QueueStep::Settled {
                index,
                name: &name,
                outcome: &outcome,
            });

            let cancelled = outcome.is_cancelled();
            outcomes.push((name, outcome));
            if cancelled {
                return QueueReport {
                    outcomes,
                    cancelled: true,
                };
            }
        }

        QueueReport {
            outcomes,
            cancelled: false,
        }
    }
}
