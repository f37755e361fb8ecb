//! Circus Engine - test tree execution
//!
//! Declares trees of describe blocks, tests and lifecycle hooks, then runs
//! them with per-unit timeouts, cancellation and concurrent batches while
//! streaming lifecycle events to subscribers.
//!
//! ## Usage
//!
//! ```ignore
//! use circus_engine::{run_tree, EngineConfig, TestTree};
//!
//! let tree = TestTree::build(|b| {
//!     b.describe("math", |b| {
//!         b.before_each(|_| async { Ok(()) });
//!         b.test("adds", |_| async {
//!             anyhow::ensure!(1 + 1 == 2);
//!             Ok(())
//!         });
//!         Ok(())
//!     });
//! });
//!
//! let result = run_tree(tree, &EngineConfig::load_default()?).await?;
//! println!("{result}");
//! ```

pub mod builder;
pub mod config;
pub mod events;
pub mod executor;
pub mod models;
pub mod results;
pub mod utils;

pub use builder::{TestOptions, TreeBuilder};
pub use config::EngineConfig;
pub use events::{Event, EventDispatcher, EventKind, HookInfo};
pub use executor::{run_tree, CancelToken, HookContext, Scheduler, StrayErrors, TestContext};
pub use models::{EngineError, RunResult, TestError, TestRecord, TestStatus, TestTree};
pub use utils::{init_logger, LogLevel};
