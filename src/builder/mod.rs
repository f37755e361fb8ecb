//! Test tree builder
//!
//! Declaration happens synchronously through a [`TreeBuilder`] that tracks
//! the current describe block. Nested `describe` calls push and pop that
//! block; a failing describe callback is contained as one synthetic failing
//! test so the rest of the file still gets collected.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use tracing::{debug, warn};

use crate::executor::{HookContext, TestContext};
use crate::models::error::panic_message;
use crate::models::{
    hook_fn, hook_fn_with_cleanup, test_fn, BlockId, BlockMode, Cleanup, EngineError, HookFn,
    HookId, HookKind, TestError, TestFn, TestId, TestMode, TestTree, DECLARATION_EXCEPTION,
};

/// Per-test declaration options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TestOptions {
    pub mode: TestMode,
    pub concurrent: bool,
    pub timeout: Option<Duration>,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip() -> Self {
        Self::new().with_mode(TestMode::Skip)
    }

    pub fn only() -> Self {
        Self::new().with_mode(TestMode::Only)
    }

    pub fn concurrent() -> Self {
        Self {
            concurrent: true,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: TestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Declaration-time view of a [`TestTree`]
pub struct TreeBuilder<'t> {
    tree: &'t mut TestTree,
    /// Open blocks; the last entry is the current block
    stack: Vec<BlockId>,
}

impl<'t> TreeBuilder<'t> {
    /// Start declaring at the root block
    pub fn new(tree: &'t mut TestTree) -> Self {
        let root = tree.root();
        Self::at(tree, root)
    }

    /// Start declaring at an arbitrary block
    pub fn at(tree: &'t mut TestTree, block: BlockId) -> Self {
        Self {
            tree,
            stack: vec![block],
        }
    }

    pub fn current_block(&self) -> BlockId {
        // The stack always holds the block the builder was created at
        self.stack[self.stack.len() - 1]
    }

    /// Create a child of the current block and make it current
    pub fn enter_block(&mut self, name: impl Into<String>, mode: BlockMode) -> BlockId {
        let name = name.into();
        let id = self.tree.push_block(self.current_block(), name, mode);
        self.stack.push(id);
        id
    }

    /// Return to the parent of the current block
    pub fn exit_block(&mut self) -> Result<(), EngineError> {
        if self.stack.len() <= 1 {
            return Err(EngineError::ExitRootBlock);
        }
        self.stack.pop();
        Ok(())
    }

    /// Declare a block and run its declaration callback against it
    pub fn describe<F>(&mut self, name: impl Into<String>, declare: F) -> BlockId
    where
        F: FnOnce(&mut TreeBuilder<'_>) -> anyhow::Result<()>,
    {
        self.describe_with(name, BlockMode::Normal, declare)
    }

    pub fn describe_skip<F>(&mut self, name: impl Into<String>, declare: F) -> BlockId
    where
        F: FnOnce(&mut TreeBuilder<'_>) -> anyhow::Result<()>,
    {
        self.describe_with(name, BlockMode::Skip, declare)
    }

    pub fn describe_only<F>(&mut self, name: impl Into<String>, declare: F) -> BlockId
    where
        F: FnOnce(&mut TreeBuilder<'_>) -> anyhow::Result<()>,
    {
        self.describe_with(name, BlockMode::Only, declare)
    }

    pub fn describe_with<F>(
        &mut self,
        name: impl Into<String>,
        mode: BlockMode,
        declare: F,
    ) -> BlockId
    where
        F: FnOnce(&mut TreeBuilder<'_>) -> anyhow::Result<()>,
    {
        let block = self.enter_block(name, mode);
        let depth = self.stack.len();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| declare(&mut *self)));

        // A panicking callback may leave nested blocks open
        self.stack.truncate(depth);

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(payload) => Some(panic_message(payload)),
        };

        if let Some(message) = failure {
            warn!(
                "Describe callback for \"{}\" failed: {}",
                self.tree.block(block).name,
                message
            );
            let test = self.tree.push_test(
                block,
                DECLARATION_EXCEPTION.to_string(),
                None,
                TestMode::Normal,
                false,
                None,
            );
            self.tree
                .test_mut(test)
                .errors
                .push(TestError::declaration(message));
        }

        self.stack.pop();
        block
    }

    /// Register a test on the current block; no body makes it a todo
    pub fn add_test(
        &mut self,
        name: impl Into<String>,
        body: Option<TestFn>,
        options: TestOptions,
    ) -> TestId {
        let name = name.into();
        let mode = if body.is_none() {
            TestMode::Todo
        } else {
            options.mode
        };
        debug!("Declaring test \"{}\" ({:?})", name, mode);
        self.tree.push_test(
            self.current_block(),
            name,
            body,
            mode,
            options.concurrent,
            options.timeout,
        )
    }

    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F) -> TestId
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_test(name, Some(test_fn(body)), TestOptions::default())
    }

    pub fn test_with<F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: TestOptions,
        body: F,
    ) -> TestId
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_test(name, Some(test_fn(body)), options)
    }

    pub fn test_concurrent<F, Fut>(&mut self, name: impl Into<String>, body: F) -> TestId
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_test(name, Some(test_fn(body)), TestOptions::concurrent())
    }

    pub fn todo(&mut self, name: impl Into<String>) -> TestId {
        self.add_test(name, None, TestOptions::default())
    }

    /// Register a hook on the current block
    pub fn add_hook(&mut self, kind: HookKind, func: HookFn, timeout: Option<Duration>) -> HookId {
        self.tree
            .push_hook(self.current_block(), kind, func, timeout)
    }

    pub fn before_all<F, Fut>(&mut self, f: F) -> HookId
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::BeforeAll, hook_fn(f), None)
    }

    pub fn before_each<F, Fut>(&mut self, f: F) -> HookId
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::BeforeEach, hook_fn(f), None)
    }

    pub fn after_each<F, Fut>(&mut self, f: F) -> HookId
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::AfterEach, hook_fn(f), None)
    }

    pub fn after_all<F, Fut>(&mut self, f: F) -> HookId
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_hook(HookKind::AfterAll, hook_fn(f), None)
    }

    /// Before-hook whose returned cleanup runs in the matching after-phase
    pub fn before_with_cleanup<F, Fut>(&mut self, kind: HookKind, f: F) -> HookId
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Cleanup>>> + Send + 'static,
    {
        self.add_hook(kind, hook_fn_with_cleanup(f), None)
    }
}

impl TestTree {
    /// Run a declaration pass against the root block
    pub fn declare<F>(&mut self, declare: F)
    where
        F: FnOnce(&mut TreeBuilder<'_>),
    {
        let mut builder = TreeBuilder::new(self);
        declare(&mut builder);
    }

    /// Build a fresh tree from one declaration pass
    pub fn build<F>(declare: F) -> Self
    where
        F: FnOnce(&mut TreeBuilder<'_>),
    {
        let mut tree = TestTree::new();
        tree.declare(declare);
        tree
    }
}
