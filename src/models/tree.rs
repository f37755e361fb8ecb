//! Test tree data model
//!
//! Describe blocks, tests and hooks live in one arena owned by [`TestTree`]
//! and refer to each other by index. Parent links are plain ids, so the tree
//! can be walked upwards without shared ownership.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::executor::{HookContext, TestContext};
use crate::models::error::{FailureKind, TestError};

/// Name given to the implicit top-level block
pub const ROOT_BLOCK_NAME: &str = "ROOT_DESCRIBE_BLOCK";

/// Title of the synthetic test recorded when a describe callback fails
pub const DECLARATION_EXCEPTION: &str = "declaration exception";

/// Body of a test
pub type TestFn = Arc<dyn Fn(TestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Cleanup returned by a before-hook, owed to the matching after-phase
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Body of a hook
pub type HookFn =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, anyhow::Result<Option<Cleanup>>> + Send + Sync>;

/// Wrap an async closure as a test body
pub fn test_fn<F, Fut>(f: F) -> TestFn
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Wrap an async closure as a hook without cleanup
pub fn hook_fn<F, Fut>(f: F) -> HookFn
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| {
        let fut = f(ctx);
        async move { fut.await.map(|()| None) }.boxed()
    })
}

/// Wrap an async closure as a hook that may hand back a cleanup
pub fn hook_fn_with_cleanup<F, Fut>(f: F) -> HookFn
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Cleanup>>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Wrap an async closure as a cleanup
pub fn cleanup<F, Fut>(f: F) -> Cleanup
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

arena_id!(BlockId, "block");
arena_id!(TestId, "test");
arena_id!(HookId, "hook");

/// Run disposition of a describe block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    #[default]
    Normal,
    Skip,
    Only,
}

/// Run disposition of a test
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    #[default]
    Normal,
    Skip,
    Only,
    Todo,
}

/// Hook flavours
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    BeforeAll,
    BeforeEach,
    AfterEach,
    AfterAll,
}

impl HookKind {
    /// `beforeAll`/`afterAll` run at most once per run
    pub fn is_shared(self) -> bool {
        matches!(self, HookKind::BeforeAll | HookKind::AfterAll)
    }

    pub fn is_before(self) -> bool {
        matches!(self, HookKind::BeforeAll | HookKind::BeforeEach)
    }

    pub fn name(self) -> &'static str {
        match self {
            HookKind::BeforeAll => "beforeAll",
            HookKind::BeforeEach => "beforeEach",
            HookKind::AfterEach => "afterEach",
            HookKind::AfterAll => "afterAll",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable run state of a test
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    #[default]
    NotStarted,
    Running,
    Passed,
    Failed,
    Skipped,
}

/// Entry in a block's ordered child list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Child {
    Block(BlockId),
    Test(TestId),
}

/// Named grouping node
#[derive(Debug)]
pub struct DescribeBlock {
    pub id: BlockId,
    pub name: String,
    pub mode: BlockMode,
    pub parent: Option<BlockId>,
    /// Blocks and tests interleaved in declaration order
    pub children: Vec<Child>,
    /// Hooks declared directly on this block, in declaration order
    pub hooks: Vec<HookId>,
}

impl DescribeBlock {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Direct child blocks in declaration order
    pub fn child_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.children.iter().filter_map(|child| match child {
            Child::Block(id) => Some(*id),
            Child::Test(_) => None,
        })
    }

    /// Direct tests in declaration order
    pub fn tests(&self) -> impl Iterator<Item = TestId> + '_ {
        self.children.iter().filter_map(|child| match child {
            Child::Test(id) => Some(*id),
            Child::Block(_) => None,
        })
    }
}

/// Leaf unit
pub struct Test {
    pub id: TestId,
    pub name: String,
    pub parent: BlockId,
    pub body: Option<TestFn>,
    pub mode: TestMode,
    pub concurrent: bool,
    /// Overrides the run-wide default timeout
    pub timeout: Option<Duration>,
    pub state: RunState,
    pub errors: Vec<TestError>,
    pub retry_reasons: Vec<TestError>,
    pub invocations: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl Test {
    /// Error captured when the enclosing describe callback failed
    pub fn declaration_error(&self) -> Option<&TestError> {
        self.errors
            .iter()
            .find(|err| err.kind == FailureKind::Declaration)
    }

    pub fn is_todo(&self) -> bool {
        self.mode == TestMode::Todo || (self.body.is_none() && self.declaration_error().is_none())
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("mode", &self.mode)
            .field("concurrent", &self.concurrent)
            .field("state", &self.state)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

/// Lifecycle hook, owned by the block it was declared on
pub struct Hook {
    pub id: HookId,
    pub kind: HookKind,
    pub parent: BlockId,
    pub func: HookFn,
    pub timeout: Option<Duration>,
    /// Set after a before-hook hands back a cleanup
    pub cleanup: Option<Cleanup>,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("timeout", &self.timeout)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish_non_exhaustive()
    }
}

/// Arena holding one declared test file
#[derive(Debug)]
pub struct TestTree {
    blocks: Vec<DescribeBlock>,
    tests: Vec<Test>,
    hooks: Vec<Hook>,
    has_focused_tests: bool,
}

impl TestTree {
    /// Create a tree holding only the implicit root block
    pub fn new() -> Self {
        let root = DescribeBlock {
            id: BlockId(0),
            name: ROOT_BLOCK_NAME.to_string(),
            mode: BlockMode::Normal,
            parent: None,
            children: Vec::new(),
            hooks: Vec::new(),
        };

        Self {
            blocks: vec![root],
            tests: Vec::new(),
            hooks: Vec::new(),
            has_focused_tests: false,
        }
    }

    pub fn root(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &DescribeBlock {
        &self.blocks[id.0]
    }

    pub fn test(&self, id: TestId) -> &Test {
        &self.tests[id.0]
    }

    pub fn test_mut(&mut self, id: TestId) -> &mut Test {
        &mut self.tests[id.0]
    }

    pub fn hook(&self, id: HookId) -> &Hook {
        &self.hooks[id.0]
    }

    pub fn hook_mut(&mut self, id: HookId) -> &mut Hook {
        &mut self.hooks[id.0]
    }

    /// All tests in creation order
    pub fn tests(&self) -> impl Iterator<Item = &Test> {
        self.tests.iter()
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    /// Whether any test or block was declared `only`
    pub fn has_focused_tests(&self) -> bool {
        self.has_focused_tests
    }

    /// Walk from `block` up to the root, `block` first
    pub fn ancestors(&self, block: BlockId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: Some(block),
        }
    }

    /// Names of the non-root blocks enclosing `block`, outermost first, `block` included
    pub fn block_path(&self, block: BlockId) -> Vec<String> {
        let mut path: Vec<String> = self
            .ancestors(block)
            .filter(|id| !self.block(*id).is_root())
            .map(|id| self.block(id).name.clone())
            .collect();
        path.reverse();
        path
    }

    /// Names of the blocks enclosing a test, outermost first
    pub fn ancestor_titles(&self, test: TestId) -> Vec<String> {
        self.block_path(self.test(test).parent)
    }

    /// Space-joined ancestor-qualified test name
    pub fn full_name(&self, test: TestId) -> String {
        let mut parts = self.ancestor_titles(test);
        parts.push(self.test(test).name.clone());
        parts.join(" ")
    }

    /// Tests below `block`, in pre-order declaration order
    pub fn descendant_tests(&self, block: BlockId) -> Vec<TestId> {
        let mut out = Vec::new();
        self.collect_tests(block, &mut out);
        out
    }

    fn collect_tests(&self, block: BlockId, out: &mut Vec<TestId>) {
        for child in &self.block(block).children {
            match child {
                Child::Test(id) => out.push(*id),
                Child::Block(id) => self.collect_tests(*id, out),
            }
        }
    }

    pub(crate) fn push_block(&mut self, parent: BlockId, name: String, mode: BlockMode) -> BlockId {
        let id = BlockId(self.blocks.len());
        if mode == BlockMode::Only {
            self.has_focused_tests = true;
        }
        self.blocks.push(DescribeBlock {
            id,
            name,
            mode,
            parent: Some(parent),
            children: Vec::new(),
            hooks: Vec::new(),
        });
        self.blocks[parent.0].children.push(Child::Block(id));
        id
    }

    pub(crate) fn push_test(
        &mut self,
        parent: BlockId,
        name: String,
        body: Option<TestFn>,
        mode: TestMode,
        concurrent: bool,
        timeout: Option<Duration>,
    ) -> TestId {
        let id = TestId(self.tests.len());
        if mode == TestMode::Only {
            self.has_focused_tests = true;
        }
        self.tests.push(Test {
            id,
            name,
            parent,
            body,
            mode,
            concurrent,
            timeout,
            state: RunState::NotStarted,
            errors: Vec::new(),
            retry_reasons: Vec::new(),
            invocations: 0,
            started_at: None,
            duration: None,
        });
        self.blocks[parent.0].children.push(Child::Test(id));
        id
    }

    pub(crate) fn push_hook(
        &mut self,
        parent: BlockId,
        kind: HookKind,
        func: HookFn,
        timeout: Option<Duration>,
    ) -> HookId {
        let id = HookId(self.hooks.len());
        self.hooks.push(Hook {
            id,
            kind,
            parent,
            func,
            timeout,
            cleanup: None,
        });
        self.blocks[parent.0].hooks.push(id);
        id
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a block and its ancestors, innermost first
pub struct Ancestors<'t> {
    tree: &'t TestTree,
    next: Option<BlockId>,
}

impl Iterator for Ancestors<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        let current = self.next?;
        self.next = self.tree.block(current).parent;
        Some(current)
    }
}
