//! Unit contexts
//!
//! Values handed to running tests and hooks, plus the run-wide state they
//! write into: declarations issued mid-run, stray errors and the set of tests
//! currently executing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use super::task::CancelToken;
use crate::builder::TestOptions;
use crate::models::{
    hook_fn, test_fn, BlockId, EngineError, HookFn, HookKind, TestError, TestFn, TestId,
};

/// Something declared while the run was already executing
pub(crate) struct LateDeclaration {
    pub block: BlockId,
    pub item: LateItem,
}

pub(crate) enum LateItem {
    Test {
        name: String,
        body: Option<TestFn>,
        options: TestOptions,
    },
    Hook {
        kind: HookKind,
        func: HookFn,
        timeout: Option<Duration>,
    },
}

#[derive(Default)]
struct SharedState {
    declarations: Vec<LateDeclaration>,
    violation: Option<EngineError>,
    /// Tests whose body is in flight, most recently started last
    active: Vec<TestId>,
    stray: HashMap<TestId, Vec<TestError>>,
    run_errors: Vec<TestError>,
}

/// Run-wide mutable state shared with running units
#[derive(Clone, Default)]
pub(crate) struct RunShared {
    inner: Arc<Mutex<SharedState>>,
}

impl RunShared {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn declare(&self, declaration: LateDeclaration) {
        self.lock().declarations.push(declaration);
    }

    pub fn drain_declarations(&self) -> Vec<LateDeclaration> {
        std::mem::take(&mut self.lock().declarations)
    }

    pub fn violate(&self, err: EngineError) {
        let mut state = self.lock();
        if state.violation.is_none() {
            state.violation = Some(err);
        }
    }

    pub fn take_violation(&self) -> Option<EngineError> {
        self.lock().violation.take()
    }

    pub fn enter_test(&self, test: TestId) {
        self.lock().active.push(test);
    }

    pub fn leave_test(&self, test: TestId) {
        self.lock().active.retain(|id| *id != test);
    }

    /// Attach to the newest active test, or keep it at run level
    pub fn report_stray(&self, err: TestError) {
        let mut state = self.lock();
        match state.active.last().copied() {
            Some(test) => state.stray.entry(test).or_default().push(err),
            None => state.run_errors.push(err),
        }
    }

    pub fn take_stray(&self, test: TestId) -> Vec<TestError> {
        self.lock().stray.remove(&test).unwrap_or_default()
    }

    pub fn push_run_error(&self, err: TestError) {
        self.lock().run_errors.push(err);
    }

    /// Run-level errors plus stray errors for tests that already completed
    pub fn take_run_errors(&self) -> Vec<TestError> {
        let mut state = self.lock();
        let mut leftover: Vec<(TestId, Vec<TestError>)> = state.stray.drain().collect();
        leftover.sort_by_key(|(test, _)| *test);
        let mut errors = std::mem::take(&mut state.run_errors);
        errors.extend(leftover.into_iter().flat_map(|(_, errs)| errs));
        errors
    }
}

/// Context visible to a running test body
#[derive(Clone)]
pub struct TestContext {
    test: TestId,
    name: String,
    full_name: String,
    attempt: u32,
    signal: CancelToken,
    shared: RunShared,
}

impl TestContext {
    pub(crate) fn new(
        test: TestId,
        name: String,
        full_name: String,
        attempt: u32,
        signal: CancelToken,
        shared: RunShared,
    ) -> Self {
        Self {
            test,
            name,
            full_name,
            attempt,
            signal,
            shared,
        }
    }

    pub fn test_id(&self) -> TestId {
        self.test
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// 1 on the first run, incremented by every retry
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Fires when the run is cancelled
    pub fn signal(&self) -> &CancelToken {
        &self.signal
    }

    /// Tests cannot declare tests; this always fails and aborts the run
    pub fn add_test(&self, name: impl Into<String>) -> Result<(), EngineError> {
        let err = EngineError::NestedDeclaration {
            test: name.into(),
            running: self.full_name.clone(),
        };
        warn!("{}", err);
        self.shared.violate(err.clone());
        Err(err)
    }
}

/// Context visible to a running hook
#[derive(Clone)]
pub struct HookContext {
    kind: HookKind,
    block: BlockId,
    block_name: String,
    test: Option<String>,
    signal: CancelToken,
    shared: RunShared,
}

impl HookContext {
    pub(crate) fn new(
        kind: HookKind,
        block: BlockId,
        block_name: String,
        test: Option<String>,
        signal: CancelToken,
        shared: RunShared,
    ) -> Self {
        Self {
            kind,
            block,
            block_name,
            test,
            signal,
            shared,
        }
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    pub fn block_name(&self) -> &str {
        &self.block_name
    }

    /// Test this hook runs for; `None` for `beforeAll`/`afterAll`
    pub fn test_name(&self) -> Option<&str> {
        self.test.as_deref()
    }

    pub fn signal(&self) -> &CancelToken {
        &self.signal
    }

    /// Append a test to the hook's block once the hook settles
    pub fn add_test<F, Fut>(&self, name: impl Into<String>, options: TestOptions, body: F)
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!("Hook on \"{}\" declared test \"{}\"", self.block_name, name);
        self.shared.declare(LateDeclaration {
            block: self.block,
            item: LateItem::Test {
                name,
                body: Some(test_fn(body)),
                options,
            },
        });
    }

    /// Append a hook to the hook's block once the hook settles
    pub fn add_hook<F, Fut>(&self, kind: HookKind, f: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.declare(LateDeclaration {
            block: self.block,
            item: LateItem::Hook {
                kind,
                func: hook_fn(f),
                timeout: None,
            },
        });
    }
}

/// Handle for errors raised by work no unit is awaiting
#[derive(Clone)]
pub struct StrayErrors {
    shared: RunShared,
}

impl StrayErrors {
    pub(crate) fn new(shared: RunShared) -> Self {
        Self { shared }
    }

    /// Attach `err` to the newest running test, or to the run if none is running
    pub fn report(&self, err: anyhow::Error) {
        warn!("Stray error: {:#}", err);
        self.shared.report_stray(TestError::unhandled(&err));
    }
}
