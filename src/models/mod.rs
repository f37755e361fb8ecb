//! Data models for the test engine
//!
//! The declared tree, contained/fatal errors, and flattened results.

pub mod error;
pub mod test_result;
pub mod tree;

pub use error::{EngineError, FailureKind, TestError};
pub use test_result::{RunResult, TestRecord, TestStatus};
pub use tree::{
    cleanup, hook_fn, hook_fn_with_cleanup, test_fn, BlockId, BlockMode, Child, Cleanup,
    DescribeBlock, Hook, HookFn, HookId, HookKind, RunState, Test, TestFn, TestId, TestMode,
    TestTree, DECLARATION_EXCEPTION, ROOT_BLOCK_NAME,
};
