//! Test execution engine
//!
//! Cancellable units, sequential queues, hook resolution and the tree
//! processor that drives a whole run.

mod context;
mod hooks;
mod queue;
mod scheduler;
mod task;

pub use context::{HookContext, StrayErrors, TestContext};
pub use hooks::{HookResolver, ResolvedHooks, SharedHookRecord};
pub use queue::{QueueReport, QueueRunner, QueueStep, QueueUnit};
pub use scheduler::{run_tree, Scheduler};
pub use task::{run_task, CancelToken, TaskOutcome, TaskRunner};
