//! Tree processor
//!
//! Walks the tree depth-first. Each block runs its own `beforeAll` hooks,
//! then its children in declaration order, then its `afterAll` hooks and the
//! cleanups its `beforeAll` hooks handed back. Each test runs its inherited
//! `beforeEach` chain, its body and its `afterEach` chain.
//!
//! Consecutive concurrent tests form a batch whose bodies overlap; the batch
//! is awaited before the next non-concurrent sibling and reported in
//! declaration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::context::{HookContext, LateItem, RunShared, StrayErrors, TestContext};
use super::hooks::{HookResolver, SharedHookRecord};
use super::queue::{QueueRunner, QueueStep, QueueUnit};
use super::task::{run_task, CancelToken, TaskOutcome};
use crate::builder::TreeBuilder;
use crate::config::EngineConfig;
use crate::events::{Event, EventDispatcher, HookInfo};
use crate::models::{
    BlockId, BlockMode, Child, Cleanup, EngineError, HookFn, HookId, HookKind, RunResult,
    RunState, TestError, TestFn, TestId, TestMode, TestTree,
};
use crate::results::ResultAggregator;
use crate::utils::Timer;

/// Handles shared by the scheduler and every unit it launches
#[derive(Clone)]
struct RunEnv {
    events: EventDispatcher,
    record: SharedHookRecord,
    shared: RunShared,
    cancel: CancelToken,
    default_timeout: Duration,
}

impl RunEnv {
    fn scope(&self, test: Option<String>) -> UnitScope {
        UnitScope {
            test,
            signal: self.cancel.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Context shared by all units of one queue
#[derive(Clone)]
struct UnitScope {
    test: Option<String>,
    signal: CancelToken,
    shared: RunShared,
}

#[derive(Clone)]
struct PlannedHook {
    info: HookInfo,
    block: BlockId,
    func: HookFn,
    timeout: Duration,
}

enum Step {
    Hook(PlannedHook),
    Cleanup {
        owner: HookKind,
        cleanup: Cleanup,
        timeout: Duration,
    },
}

struct StepOwner {
    kind: HookKind,
    hook: Option<(HookInfo, BlockId)>,
}

#[derive(Default)]
struct StepReport {
    errors: Vec<TestError>,
    cleanups: Vec<(HookId, BlockId, Cleanup)>,
    cancelled: bool,
}

fn step_error<T>(kind: HookKind, outcome: &TaskOutcome<T>) -> Option<TestError> {
    match outcome {
        TaskOutcome::Failure(err) => Some(TestError::hook(kind, err)),
        TaskOutcome::TimedOut(limit) => Some(TestError::timeout("hook", *limit)),
        TaskOutcome::Success(_) | TaskOutcome::Cancelled => None,
    }
}

fn hook_unit(
    hook: PlannedHook,
    record: SharedHookRecord,
) -> QueueUnit<UnitScope, Option<Cleanup>> {
    let PlannedHook {
        info,
        block,
        func,
        timeout,
    } = hook;
    let name = format!("{} ({})", info.kind, info.block_name);

    QueueUnit::new(name, timeout, move |scope: UnitScope| async move {
        if info.kind.is_shared() && !record.claim(info.hook) {
            return Ok(None);
        }
        let ctx = HookContext::new(
            info.kind,
            block,
            info.block_name,
            scope.test,
            scope.signal,
            scope.shared,
        );
        func(ctx).await
    })
}

/// Run hooks and cleanups through one queue, emitting hook events
async fn run_steps(steps: Vec<Step>, scope: UnitScope, env: &RunEnv) -> StepReport {
    let mut queue = QueueRunner::with_parent(scope, &env.cancel);
    let mut owners = Vec::with_capacity(steps.len());

    for step in steps {
        match step {
            Step::Hook(hook) => {
                owners.push(StepOwner {
                    kind: hook.info.kind,
                    hook: Some((hook.info.clone(), hook.block)),
                });
                queue.push(hook_unit(hook, env.record.clone()));
            }
            Step::Cleanup {
                owner,
                cleanup,
                timeout,
            } => {
                owners.push(StepOwner {
                    kind: owner,
                    hook: None,
                });
                queue.push(QueueUnit::new(
                    format!("{owner} cleanup"),
                    timeout,
                    move |_: UnitScope| async move { cleanup().await.map(|()| None) },
                ));
            }
        }
    }

    let events = &env.events;
    let report = queue
        .run_with(|step| match step {
            QueueStep::Starting { index, .. } => {
                if let Some((info, _)) = &owners[index].hook {
                    events.emit(&Event::HookStart(info.clone()));
                }
            }
            QueueStep::Settled { index, outcome, .. } => {
                if let Some((info, _)) = &owners[index].hook {
                    if let Some(error) = step_error(info.kind, outcome) {
                        events.emit(&Event::HookFailure {
                            hook: info.clone(),
                            error,
                        });
                    } else if outcome.is_success() {
                        events.emit(&Event::HookSuccess(info.clone()));
                    }
                }
            }
        })
        .await;

    let mut result = StepReport {
        cancelled: report.cancelled,
        ..StepReport::default()
    };

    for ((_, outcome), owner) in report.outcomes.into_iter().zip(owners) {
        match outcome {
            TaskOutcome::Success(Some(cleanup)) => {
                if let Some((info, block)) = owner.hook {
                    result.cleanups.push((info.hook, block, cleanup));
                }
            }
            TaskOutcome::Success(None) | TaskOutcome::Cancelled => {}
            other => result.errors.extend(step_error(owner.kind, &other)),
        }
    }

    result
}

/// What the scheduler does with a test it reached
enum Disposition {
    Skip,
    Fail(TestError),
    Run,
}

/// Everything needed to run one test without touching the tree
struct TestPlan {
    test: TestId,
    name: String,
    full_name: String,
    body: Option<TestFn>,
    timeout: Duration,
    before: Vec<PlannedHook>,
    /// Ancestor blocks, innermost first, each with its own `afterEach` hooks
    after: Vec<(BlockId, Vec<PlannedHook>)>,
    retry_times: u32,
    limit: Option<Arc<Semaphore>>,
    env: RunEnv,
}

struct TestRun {
    errors: Vec<TestError>,
    retry_reasons: Vec<TestError>,
    invocations: u32,
    started_at: DateTime<Utc>,
    duration: Duration,
}

struct Attempt {
    errors: Vec<TestError>,
    cancelled: bool,
}

impl TestPlan {
    async fn execute(&self) -> TestRun {
        let _permit = match &self.limit {
            Some(limit) => limit.clone().acquire_owned().await.ok(),
            None => None,
        };

        let timer = Timer::start(self.full_name.as_str());
        self.env.events.emit(&Event::TestStart {
            test: self.test,
            full_name: self.full_name.clone(),
        });

        let mut retry_reasons = Vec::new();
        let mut attempt = 1;
        loop {
            let outcome = self.attempt(attempt).await;
            if outcome.errors.is_empty() || outcome.cancelled || attempt > self.retry_times {
                return TestRun {
                    errors: outcome.errors,
                    retry_reasons,
                    invocations: attempt,
                    started_at: timer.started_at(),
                    duration: timer.stop(),
                };
            }

            attempt += 1;
            debug!("Retrying \"{}\" (attempt {})", self.full_name, attempt);
            self.env.events.emit(&Event::TestRetry {
                test: self.test,
                full_name: self.full_name.clone(),
                attempt,
                reasons: outcome.errors.clone(),
            });
            retry_reasons.extend(outcome.errors);
        }
    }

    async fn attempt(&self, attempt: u32) -> Attempt {
        // Active for the whole attempt so stray errors from its hooks land here too
        self.env.shared.enter_test(self.test);

        let steps = self.before.iter().cloned().map(Step::Hook).collect();
        let before = run_steps(steps, self.scope(), &self.env).await;

        let mut errors = before.errors;
        let mut cancelled = before.cancelled;
        let mut cleanups: HashMap<BlockId, Vec<Cleanup>> = HashMap::new();
        for (_, block, cleanup) in before.cleanups {
            cleanups.entry(block).or_default().push(cleanup);
        }

        if cancelled {
            errors.push(TestError::cancelled("test"));
        } else if errors.is_empty() {
            if let Some(body) = &self.body {
                let ctx = TestContext::new(
                    self.test,
                    self.name.clone(),
                    self.full_name.clone(),
                    attempt,
                    self.env.cancel.clone(),
                    self.env.shared.clone(),
                );
                let body = body.clone();
                let outcome = run_task(move || body(ctx), self.timeout, &self.env.cancel).await;

                match outcome {
                    TaskOutcome::Success(()) => {}
                    TaskOutcome::Failure(err) => errors.push(TestError::test(&err)),
                    TaskOutcome::TimedOut(limit) => {
                        warn!("\"{}\" timed out after {}ms", self.full_name, limit.as_millis());
                        errors.push(TestError::timeout("test", limit));
                    }
                    TaskOutcome::Cancelled => {
                        errors.push(TestError::cancelled("test"));
                        cancelled = true;
                    }
                }
            }
        }

        // Per block, innermost first: owed cleanups newest first, then afterEach hooks
        let mut steps = Vec::new();
        for (block, hooks) in &self.after {
            for cleanup in cleanups.remove(block).unwrap_or_default().into_iter().rev() {
                steps.push(Step::Cleanup {
                    owner: HookKind::BeforeEach,
                    cleanup,
                    timeout: self.env.default_timeout,
                });
            }
            steps.extend(hooks.iter().cloned().map(Step::Hook));
        }
        let after = run_steps(steps, self.scope(), &self.env).await;
        errors.extend(after.errors);
        self.env.shared.leave_test(self.test);

        Attempt {
            errors,
            cancelled: cancelled || after.cancelled,
        }
    }

    fn scope(&self) -> UnitScope {
        self.env.scope(Some(self.full_name.clone()))
    }
}

/// Runs one declared tree, exactly once
pub struct Scheduler {
    tree: TestTree,
    env: RunEnv,
    retry_times: u32,
    name_pattern: Option<Regex>,
    seed: Option<u64>,
    rng: Option<StdRng>,
    limit: Arc<Semaphore>,
    ran: bool,
}

impl Scheduler {
    pub fn new(tree: TestTree, config: &EngineConfig) -> Result<Self, EngineError> {
        let name_pattern = config
            .test_name_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| EngineError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;

        let seed = config
            .randomize
            .then(|| config.seed.unwrap_or_else(rand::random));

        Ok(Self {
            tree,
            env: RunEnv {
                events: EventDispatcher::new(),
                record: SharedHookRecord::new(),
                shared: RunShared::default(),
                cancel: CancelToken::new(),
                default_timeout: config.default_timeout(),
            },
            retry_times: config.retry_times,
            name_pattern,
            seed,
            rng: seed.map(StdRng::seed_from_u64),
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            ran: false,
        })
    }

    /// Subscribe here before calling [`Scheduler::run`]
    pub fn events(&self) -> &EventDispatcher {
        &self.env.events
    }

    /// Run-level cancellation; not-yet-started units never start once fired
    pub fn cancel_handle(&self) -> CancelToken {
        self.env.cancel.clone()
    }

    pub fn stray_errors(&self) -> StrayErrors {
        StrayErrors::new(self.env.shared.clone())
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn tree(&self) -> &TestTree {
        &self.tree
    }

    /// Declare more before the run starts
    pub fn tree_mut(&mut self) -> &mut TestTree {
        &mut self.tree
    }

    pub fn into_tree(self) -> TestTree {
        self.tree
    }

    /// Execute the whole tree and aggregate the results
    pub async fn run(&mut self) -> Result<RunResult, EngineError> {
        if self.ran {
            return Err(EngineError::AlreadyRan);
        }
        self.ran = true;

        let timer = Timer::start("run");
        let test_count = self.tree.test_count();
        info!("Starting run of {} tests (seed: {:?})", test_count, self.seed);
        self.env.events.emit(&Event::RunStart {
            test_count,
            seed: self.seed,
        });

        let root = self.tree.root();
        self.run_block(root, None).await?;

        let run_errors = self.env.shared.take_run_errors();
        let started_at = timer.started_at();
        let duration_ms = timer.stop().as_millis() as u64;
        let result = ResultAggregator::new(&self.tree).aggregate(
            &run_errors,
            self.seed,
            started_at,
            duration_ms,
        );

        info!(
            "Run completed in {}ms - Pass: {} | Fail: {} | Skip: {}",
            result.duration_ms, result.passed, result.failed, result.skipped
        );
        self.env.events.emit(&Event::RunFinish {
            result: Box::new(result.clone()),
        });

        Ok(result)
    }

    fn run_block(
        &mut self,
        block: BlockId,
        inherited: Option<TestError>,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            let is_root = self.tree.block(block).is_root();
            if !is_root {
                self.env.events.emit(&Event::BlockStart {
                    block,
                    name: self.tree.block(block).name.clone(),
                    path: self.tree.block_path(block),
                });
            }

            // Blocks under a failed beforeAll, and blocks with nothing to run, run no hooks
            let run_hooks = inherited.is_none() && self.has_runnable_tests(block);
            let mut failure = inherited;

            if run_hooks {
                if let Some(err) = self.run_before_all(block).await {
                    failure = Some(err);
                }
                self.apply_late_declarations()?;
            }

            let generation = self.tree.block(block).children.len();
            let children = self.ordered_children(block, 0, generation);
            self.run_children(children, failure.as_ref()).await?;

            let appended = self.tree.block(block).children.len();
            if appended > generation {
                debug!(
                    "Running {} children appended to \"{}\" during the run",
                    appended - generation,
                    self.tree.block(block).name
                );
                let late = self.ordered_children(block, generation, appended);
                self.run_children(late, failure.as_ref()).await?;
            }

            if run_hooks {
                self.run_after_all(block).await;
                self.apply_late_declarations()?;
            }

            if !is_root {
                self.env.events.emit(&Event::BlockEnd {
                    block,
                    name: self.tree.block(block).name.clone(),
                    path: self.tree.block_path(block),
                });
            }
            Ok(())
        }
        .boxed()
    }

    async fn run_children(
        &mut self,
        children: Vec<Child>,
        failure: Option<&TestError>,
    ) -> Result<(), EngineError> {
        let mut batch = Vec::new();

        for child in children {
            match child {
                Child::Test(test) if self.tree.test(test).concurrent => batch.push(test),
                Child::Test(test) => {
                    self.flush_batch(&mut batch, failure).await?;
                    self.run_test(test, failure).await?;
                }
                Child::Block(nested) => {
                    self.flush_batch(&mut batch, failure).await?;
                    self.run_block(nested, failure.cloned()).await?;
                }
            }
        }

        self.flush_batch(&mut batch, failure).await
    }

    async fn run_test(
        &mut self,
        test: TestId,
        failure: Option<&TestError>,
    ) -> Result<(), EngineError> {
        match self.disposition(test, failure) {
            Disposition::Skip => self.report_skip(test),
            Disposition::Fail(err) => self.report_unrun_failure(test, err),
            Disposition::Run => {
                let plan = self.plan_test(test, None);
                self.tree.test_mut(test).state = RunState::Running;
                let run = plan.execute().await;
                self.finish_test(test, run);
            }
        }
        self.apply_late_declarations()
    }

    /// Start every collected concurrent test, then report them in order
    async fn flush_batch(
        &mut self,
        batch: &mut Vec<TestId>,
        failure: Option<&TestError>,
    ) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        let tests = std::mem::take(batch);
        debug!("Running batch of {} concurrent tests", tests.len());

        let dispositions: Vec<Disposition> = tests
            .iter()
            .map(|test| self.disposition(*test, failure))
            .collect();
        let plans: Vec<TestPlan> = tests
            .iter()
            .zip(&dispositions)
            .filter(|(_, disposition)| matches!(disposition, Disposition::Run))
            .map(|(test, _)| self.plan_test(*test, Some(self.limit.clone())))
            .collect();
        for plan in &plans {
            self.tree.test_mut(plan.test).state = RunState::Running;
        }

        let runs = join_all(plans.iter().map(TestPlan::execute)).await;
        let mut runs = runs.into_iter();

        for (test, disposition) in tests.into_iter().zip(dispositions) {
            match disposition {
                Disposition::Skip => self.report_skip(test),
                Disposition::Fail(err) => self.report_unrun_failure(test, err),
                Disposition::Run => {
                    if let Some(run) = runs.next() {
                        self.finish_test(test, run);
                    }
                }
            }
        }

        self.apply_late_declarations()
    }

    fn disposition(&self, test: TestId, failure: Option<&TestError>) -> Disposition {
        if self.is_declared_skipped(test) {
            return Disposition::Skip;
        }
        // A broken describe still fails under focus or a name filter
        if let Some(err) = self.tree.test(test).declaration_error() {
            return Disposition::Fail(err.clone());
        }
        if self.is_filtered(test) {
            return Disposition::Skip;
        }
        if let Some(err) = failure {
            return Disposition::Fail(err.clone());
        }
        if self.env.cancel.is_cancelled() {
            return Disposition::Skip;
        }
        Disposition::Run
    }

    fn is_skipped(&self, test: TestId) -> bool {
        self.is_declared_skipped(test) || self.is_filtered(test)
    }

    fn ancestor_modes(&self, test: TestId) -> Vec<BlockMode> {
        self.tree
            .ancestors(self.tree.test(test).parent)
            .map(|block| self.tree.block(block).mode)
            .collect()
    }

    /// Skip block ancestry, own skip or todo
    fn is_declared_skipped(&self, test: TestId) -> bool {
        let entry = self.tree.test(test);
        self.ancestor_modes(test).contains(&BlockMode::Skip)
            || entry.mode == TestMode::Skip
            || entry.is_todo()
    }

    /// Outside the focused tests, or not matching the name filter
    fn is_filtered(&self, test: TestId) -> bool {
        if self.tree.has_focused_tests()
            && self.tree.test(test).mode != TestMode::Only
            && !self.ancestor_modes(test).contains(&BlockMode::Only)
        {
            return true;
        }
        self.name_pattern
            .as_ref()
            .is_some_and(|pattern| !pattern.is_match(&self.tree.full_name(test)))
    }

    fn has_runnable_tests(&self, block: BlockId) -> bool {
        self.tree.descendant_tests(block).into_iter().any(|test| {
            !self.is_skipped(test) && self.tree.test(test).declaration_error().is_none()
        })
    }

    fn ordered_children(&mut self, block: BlockId, from: usize, to: usize) -> Vec<Child> {
        let mut children = self.tree.block(block).children[from..to].to_vec();
        if let Some(rng) = self.rng.as_mut() {
            children.shuffle(rng);
        }
        children
    }

    fn planned_hook(&self, hook: HookId, test: Option<&str>) -> PlannedHook {
        let entry = self.tree.hook(hook);
        PlannedHook {
            info: HookInfo {
                hook,
                kind: entry.kind,
                block_name: self.tree.block(entry.parent).name.clone(),
                test: test.map(str::to_string),
            },
            block: entry.parent,
            func: entry.func.clone(),
            timeout: entry.timeout.unwrap_or(self.env.default_timeout),
        }
    }

    fn plan_test(&self, test: TestId, limit: Option<Arc<Semaphore>>) -> TestPlan {
        let entry = self.tree.test(test);
        let full_name = self.tree.full_name(test);
        let resolved = HookResolver::new(&self.tree).resolve(test);

        // Shared hooks already ran when their block was entered
        let before = resolved
            .before
            .iter()
            .filter(|hook| !self.env.record.has_run(**hook))
            .map(|hook| self.planned_hook(*hook, Some(&full_name)))
            .collect();

        // afterAll hooks are owed to their block's exit, not to each test
        let after = self
            .tree
            .ancestors(entry.parent)
            .map(|block| {
                let hooks = resolved
                    .after
                    .iter()
                    .filter(|hook| {
                        let hook = self.tree.hook(**hook);
                        hook.parent == block && hook.kind == HookKind::AfterEach
                    })
                    .map(|hook| self.planned_hook(*hook, Some(&full_name)))
                    .collect();
                (block, hooks)
            })
            .collect();

        TestPlan {
            test,
            name: entry.name.clone(),
            full_name,
            body: entry.body.clone(),
            timeout: entry.timeout.unwrap_or(self.env.default_timeout),
            before,
            after,
            retry_times: self.retry_times,
            limit,
            env: self.env.clone(),
        }
    }

    /// Returns the first failure, which then applies to every test below `block`
    async fn run_before_all(&mut self, block: BlockId) -> Option<TestError> {
        let steps: Vec<Step> = HookResolver::new(&self.tree)
            .block_hooks(block, HookKind::BeforeAll)
            .into_iter()
            .filter(|hook| !self.env.record.has_run(*hook))
            .map(|hook| Step::Hook(self.planned_hook(hook, None)))
            .collect();
        if steps.is_empty() {
            return None;
        }

        let report = run_steps(steps, self.env.scope(None), &self.env).await;
        for (hook, _, cleanup) in report.cleanups {
            self.tree.hook_mut(hook).cleanup = Some(cleanup);
        }
        report.errors.into_iter().next()
    }

    /// Owed `beforeAll` cleanups newest first, then `afterAll` hooks
    async fn run_after_all(&mut self, block: BlockId) {
        let (before_all, after_all) = {
            let resolver = HookResolver::new(&self.tree);
            (
                resolver.block_hooks(block, HookKind::BeforeAll),
                resolver.block_hooks(block, HookKind::AfterAll),
            )
        };

        let mut steps = Vec::new();
        for hook in before_all.into_iter().rev() {
            if let Some(cleanup) = self.tree.hook_mut(hook).cleanup.take() {
                steps.push(Step::Cleanup {
                    owner: HookKind::BeforeAll,
                    cleanup,
                    timeout: self.env.default_timeout,
                });
            }
        }
        steps.extend(
            after_all
                .into_iter()
                .filter(|hook| !self.env.record.has_run(*hook))
                .map(|hook| Step::Hook(self.planned_hook(hook, None))),
        );
        if steps.is_empty() {
            return;
        }

        let report = run_steps(steps, self.env.scope(None), &self.env).await;
        for err in report.errors {
            warn!("{} in \"{}\"", err, self.tree.block(block).name);
            self.env.shared.push_run_error(err);
        }
    }

    fn report_skip(&mut self, test: TestId) {
        let full_name = self.tree.full_name(test);
        let entry = self.tree.test_mut(test);
        entry.state = RunState::Skipped;
        let todo = entry.is_todo();
        self.env.events.emit(&Event::TestSkip {
            test,
            full_name,
            todo,
        });
    }

    /// Fail a test whose body never ran
    fn report_unrun_failure(&mut self, test: TestId, err: TestError) {
        let full_name = self.tree.full_name(test);
        self.env.events.emit(&Event::TestStart {
            test,
            full_name: full_name.clone(),
        });

        let entry = self.tree.test_mut(test);
        if !entry.errors.contains(&err) {
            entry.errors.push(err);
        }
        entry.errors.extend(self.env.shared.take_stray(test));
        entry.state = RunState::Failed;
        entry.started_at = Some(Utc::now());
        entry.duration = Some(Duration::ZERO);
        let errors = entry.errors.clone();

        self.env.events.emit(&Event::TestFailure {
            test,
            full_name,
            errors,
            duration: Duration::ZERO,
        });
    }

    fn finish_test(&mut self, test: TestId, run: TestRun) {
        let full_name = self.tree.full_name(test);
        let mut errors = run.errors;
        errors.extend(self.env.shared.take_stray(test));

        let entry = self.tree.test_mut(test);
        entry.retry_reasons = run.retry_reasons;
        entry.invocations = run.invocations;
        entry.started_at = Some(run.started_at);
        entry.duration = Some(run.duration);
        entry.state = if errors.is_empty() {
            RunState::Passed
        } else {
            RunState::Failed
        };
        entry.errors = errors.clone();

        if errors.is_empty() {
            debug!("✓ {} ({}ms)", full_name, run.duration.as_millis());
            self.env.events.emit(&Event::TestSuccess {
                test,
                full_name,
                duration: run.duration,
            });
        } else {
            debug!("✗ {} ({} errors)", full_name, errors.len());
            self.env.events.emit(&Event::TestFailure {
                test,
                full_name,
                errors,
                duration: run.duration,
            });
        }
    }

    /// Attach declarations issued by running hooks; abort on a nested test
    fn apply_late_declarations(&mut self) -> Result<(), EngineError> {
        if let Some(err) = self.env.shared.take_violation() {
            return Err(err);
        }
        for late in self.env.shared.drain_declarations() {
            let mut builder = TreeBuilder::at(&mut self.tree, late.block);
            match late.item {
                LateItem::Test {
                    name,
                    body,
                    options,
                } => {
                    builder.add_test(name, body, options);
                }
                LateItem::Hook {
                    kind,
                    func,
                    timeout,
                } => {
                    builder.add_hook(kind, func, timeout);
                }
            }
        }
        Ok(())
    }
}

/// Build a scheduler for `tree` and run it
pub async fn run_tree(tree: TestTree, config: &EngineConfig) -> Result<RunResult, EngineError> {
    Scheduler::new(tree, config)?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TestOptions;
    use crate::events::EventKind;
    use crate::models::{cleanup, hook_fn, hook_fn_with_cleanup, test_fn, FailureKind, TestStatus};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn new_log() -> Log {
        Arc::default()
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn log_hook(log: &Log, entry: &'static str) -> HookFn {
        let log = log.clone();
        hook_fn(move |_| {
            log.lock().unwrap().push(entry.to_string());
            async { Ok(()) }
        })
    }

    fn log_test(log: &Log, entry: &'static str) -> Option<TestFn> {
        let log = log.clone();
        Some(test_fn(move |_| {
            log.lock().unwrap().push(entry.to_string());
            async { Ok(()) }
        }))
    }

    fn event_names(events: &Arc<Mutex<Vec<Event>>>) -> Vec<String> {
        events.lock().unwrap().iter().map(|e| e.to_string()).collect()
    }

    async fn run(tree: TestTree) -> RunResult {
        run_tree(tree, &EngineConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_hooks_wrap_tests_outer_to_inner() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.add_hook(HookKind::BeforeAll, log_hook(&log, "root beforeAll"), None);
            b.add_hook(HookKind::BeforeEach, log_hook(&log, "root beforeEach"), None);
            b.add_hook(HookKind::AfterEach, log_hook(&log, "root afterEach"), None);
            b.add_hook(HookKind::AfterAll, log_hook(&log, "root afterAll"), None);
            b.add_test("a", log_test(&log, "a"), TestOptions::default());
            b.describe("inner", |b| {
                b.add_hook(HookKind::BeforeEach, log_hook(&log, "inner beforeEach"), None);
                b.add_hook(HookKind::AfterEach, log_hook(&log, "inner afterEach"), None);
                b.add_test("b", log_test(&log, "b"), TestOptions::default());
                Ok(())
            });
        });

        let result = run(tree).await;
        assert_eq!(result.passed, 2);
        assert_eq!(
            entries(&log),
            vec![
                "root beforeAll",
                "root beforeEach",
                "a",
                "root afterEach",
                "root beforeEach",
                "inner beforeEach",
                "b",
                "inner afterEach",
                "root afterEach",
                "root afterAll",
            ]
        );
    }

    #[tokio::test]
    async fn test_event_stream_order() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.describe("suite", |b| {
                b.add_hook(HookKind::BeforeEach, log_hook(&log, "setup"), None);
                b.add_test("works", log_test(&log, "works"), TestOptions::default());
                b.todo("later");
                Ok(())
            });
        });

        let mut scheduler = Scheduler::new(tree, &EngineConfig::default()).unwrap();
        let events = scheduler.events().record();
        scheduler.run().await.unwrap();

        assert_eq!(
            event_names(&events),
            vec![
                "run_start(2)",
                "block_start:suite",
                "test_start:suite works",
                "hook_start:beforeEach",
                "hook_success:beforeEach",
                "test_success:suite works",
                "test_skip:suite later",
                "block_end:suite",
                "run_finish(2)",
            ]
        );
    }

    #[tokio::test]
    async fn test_skipped_block_runs_no_hooks() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.describe_skip("skipped", |b| {
                b.add_hook(HookKind::BeforeAll, log_hook(&log, "beforeAll"), None);
                b.add_hook(HookKind::BeforeEach, log_hook(&log, "beforeEach"), None);
                b.add_hook(HookKind::AfterAll, log_hook(&log, "afterAll"), None);
                b.add_test("plain", log_test(&log, "plain"), TestOptions::default());
                b.add_test("focused", log_test(&log, "focused"), TestOptions::only());
                b.todo("todo");
                b.describe("nested", |b| {
                    b.add_test("deep", log_test(&log, "deep"), TestOptions::default());
                    Ok(())
                });
                Ok(())
            });
        });

        let result = run(tree).await;
        assert!(entries(&log).is_empty());
        assert_eq!(result.total, 4);
        assert_eq!(result.skipped, 4);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_shared_hooks_run_once() {
        let before_all = Arc::new(AtomicUsize::new(0));
        let after_all = Arc::new(AtomicUsize::new(0));
        let (before, after) = (before_all.clone(), after_all.clone());

        let tree = TestTree::build(move |b| {
            b.before_all(move |_| {
                before.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            });
            b.after_all(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            });
            for group in ["one", "two"] {
                b.describe(group, |b| {
                    b.test("x", |_| async { Ok(()) });
                    b.test("y", |_| async { Ok(()) });
                    Ok(())
                });
            }
        });

        let result = run(tree).await;
        assert_eq!(result.passed, 4);
        assert_eq!(before_all.load(Ordering::SeqCst), 1);
        assert_eq!(after_all.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_batch_reports_in_declaration_order() {
        let log = new_log();
        let (slow, fast) = (log.clone(), log.clone());

        let tree = TestTree::build(|b| {
            b.test_concurrent("A", move |_| {
                let log = slow.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    log.lock().unwrap().push("A done".into());
                    Ok(())
                }
            });
            b.test_concurrent("B", move |_| {
                let log = fast.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    log.lock().unwrap().push("B done".into());
                    Ok(())
                }
            });
            b.add_test("C", log_test(&log, "C done"), TestOptions::default());
        });

        let mut scheduler = Scheduler::new(tree, &EngineConfig::default()).unwrap();
        let completions = Arc::new(Mutex::new(Vec::new()));
        let sink = completions.clone();
        scheduler.events().subscribe(EventKind::TestSuccess, move |event| {
            sink.lock().unwrap().push(event.to_string());
        });

        let result = scheduler.run().await.unwrap();
        assert_eq!(result.passed, 3);
        assert_eq!(entries(&log), vec!["B done", "A done", "C done"]);
        assert_eq!(
            *completions.lock().unwrap(),
            vec!["test_success:A", "test_success:B", "test_success:C"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_batch_failures_flushed_by_nested_block() {
        let tree = TestTree::build(|b| {
            b.test_concurrent("A", |_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                anyhow::bail!("A broke")
            });
            b.test_with(
                "B",
                TestOptions::concurrent().with_timeout(Duration::from_millis(10)),
                |_| futures::future::pending::<anyhow::Result<()>>(),
            );
            b.describe("group", |b| {
                b.test("inner", |_| async { Ok(()) });
                Ok(())
            });
            b.test("C", |_| async { Ok(()) });
        });

        let mut scheduler = Scheduler::new(tree, &EngineConfig::default()).unwrap();
        let events = scheduler.events().record();
        let result = scheduler.run().await.unwrap();

        let reported: Vec<String> = event_names(&events)
            .into_iter()
            .filter(|e| {
                ["test_success", "test_failure", "block_start", "block_end"]
                    .iter()
                    .any(|prefix| e.starts_with(prefix))
            })
            .collect();
        assert_eq!(
            reported,
            vec![
                "test_failure:A",
                "test_failure:B",
                "block_start:group",
                "test_success:group inner",
                "block_end:group",
                "test_success:C",
            ]
        );
        assert_eq!(result.record("A").unwrap().errors, vec!["A broke"]);
        assert_eq!(
            result.record("B").unwrap().errors,
            vec!["Exceeded timeout of 10 ms for a test."]
        );
        assert_eq!(result.passed, 2);
    }

    #[tokio::test]
    async fn test_max_concurrency_limits_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tree = TestTree::build(|b| {
            for name in ["a", "b", "c", "d"] {
                let (in_flight, peak) = (in_flight.clone(), peak.clone());
                b.test_concurrent(name, move |_| {
                    let (in_flight, peak) = (in_flight.clone(), peak.clone());
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
            }
        });

        let config = EngineConfig::default().with_max_concurrency(2);
        let result = run_tree(tree, &config).await.unwrap();
        assert_eq!(result.passed, 4);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_before_each_failure_fails_every_test() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.describe("block", |b| {
                b.before_each(|_| async { anyhow::bail!("connection refused") });
                b.add_hook(HookKind::AfterEach, log_hook(&log, "afterEach"), None);
                b.add_hook(HookKind::AfterAll, log_hook(&log, "afterAll"), None);
                for name in ["one", "two", "three"] {
                    b.add_test(name, log_test(&log, "body"), TestOptions::default());
                }
                Ok(())
            });
        });

        let result = run(tree).await;
        assert_eq!(result.failed, 3);
        for record in &result.records {
            assert_eq!(
                record.errors,
                vec!["beforeEach hook failed: connection refused"]
            );
        }
        assert_eq!(
            entries(&log),
            vec!["afterEach", "afterEach", "afterEach", "afterAll"]
        );
    }

    #[tokio::test]
    async fn test_before_all_failure_fails_subtree_and_still_runs_after_all() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.describe("outer", |b| {
                b.before_all(|_| async { anyhow::bail!("no database") });
                b.add_hook(HookKind::AfterAll, log_hook(&log, "outer afterAll"), None);
                b.add_test("direct", log_test(&log, "direct"), TestOptions::default());
                b.describe("nested", |b| {
                    b.add_hook(HookKind::BeforeAll, log_hook(&log, "nested beforeAll"), None);
                    b.add_test("deep", log_test(&log, "deep"), TestOptions::default());
                    Ok(())
                });
                Ok(())
            });
            b.add_test("sibling", log_test(&log, "sibling"), TestOptions::default());
        });

        let result = run(tree).await;
        assert_eq!(entries(&log), vec!["outer afterAll", "sibling"]);
        assert_eq!(result.failed, 2);
        assert_eq!(result.passed, 1);
        let deep = result.record("outer nested deep").unwrap();
        assert_eq!(deep.errors, vec!["beforeAll hook failed: no database"]);
    }

    #[tokio::test]
    async fn test_body_failure_is_contained() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.add_hook(HookKind::AfterAll, log_hook(&log, "afterAll"), None);
            b.test("fails", |_| async {
                assert_eq!(2 + 2, 5, "math is broken");
                Ok(())
            });
            b.add_test("passes", log_test(&log, "passes"), TestOptions::default());
        });

        let result = run(tree).await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.passed, 1);
        assert!(result.records[0].errors[0].contains("math is broken"));
        assert_eq!(entries(&log), vec!["passes", "afterAll"]);
    }

    #[tokio::test]
    async fn test_hook_timeout_still_reaches_run_finish() {
        let tree = TestTree::build(|b| {
            b.add_hook(
                HookKind::BeforeEach,
                hook_fn(|_| futures::future::pending::<anyhow::Result<()>>()),
                Some(Duration::from_millis(10)),
            );
            b.test("waits", |_| async { Ok(()) });
        });

        let mut scheduler = Scheduler::new(tree, &EngineConfig::default()).unwrap();
        let events = scheduler.events().record();
        let result = scheduler.run().await.unwrap();

        let events = events.lock().unwrap();
        let timeout = events.iter().find_map(|event| match event {
            Event::HookFailure { error, .. } => Some(error.clone()),
            _ => None,
        });
        assert_eq!(timeout.map(|e| e.kind), Some(FailureKind::Timeout));
        assert!(matches!(events.last(), Some(Event::RunFinish { .. })));
        assert_eq!(
            result.records[0].errors,
            vec!["Exceeded timeout of 10 ms for a hook."]
        );
    }

    #[tokio::test]
    async fn test_body_timeout() {
        let tree = TestTree::build(|b| {
            b.test_with(
                "hangs",
                TestOptions::new().with_timeout(Duration::from_millis(10)),
                |_| futures::future::pending::<anyhow::Result<()>>(),
            );
        });

        let result = run(tree).await;
        assert_eq!(result.records[0].status, TestStatus::Failed);
        assert_eq!(
            result.records[0].errors,
            vec!["Exceeded timeout of 10 ms for a test."]
        );
    }

    #[tokio::test]
    async fn test_cleanups_run_before_after_hooks_of_their_block() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            let cleanup_log = log.clone();
            b.before_with_cleanup(HookKind::BeforeAll, move |_| {
                let log = cleanup_log.clone();
                async move {
                    Ok(Some(cleanup(move || async move {
                        log.lock().unwrap().push("beforeAll cleanup".into());
                        Ok(())
                    })))
                }
            });
            b.add_hook(HookKind::AfterAll, log_hook(&log, "afterAll"), None);
            b.describe("inner", |b| {
                let each_log = log.clone();
                b.add_hook(
                    HookKind::BeforeEach,
                    hook_fn_with_cleanup(move |_| {
                        let log = each_log.clone();
                        async move {
                            Ok(Some(cleanup(move || async move {
                                log.lock().unwrap().push("beforeEach cleanup".into());
                                Ok(())
                            })))
                        }
                    }),
                    None,
                );
                b.add_hook(HookKind::AfterEach, log_hook(&log, "afterEach"), None);
                b.add_test("t", log_test(&log, "t"), TestOptions::default());
                Ok(())
            });
        });

        run(tree).await;
        assert_eq!(
            entries(&log),
            vec![
                "t",
                "beforeEach cleanup",
                "afterEach",
                "beforeAll cleanup",
                "afterAll"
            ]
        );
    }

    #[tokio::test]
    async fn test_hook_declared_children_run_in_extra_pass() {
        let log = new_log();
        let once = Arc::new(AtomicBool::new(false));
        let tree = TestTree::build(|b| {
            let generated = log.clone();
            b.before_each(move |ctx| {
                if !once.swap(true, Ordering::SeqCst) {
                    let log = generated.clone();
                    ctx.add_test("generated", TestOptions::default(), move |_| {
                        log.lock().unwrap().push("generated".into());
                        async { Ok(()) }
                    });
                }
                async { Ok(()) }
            });
            b.add_test("first", log_test(&log, "first"), TestOptions::default());
            b.add_test("second", log_test(&log, "second"), TestOptions::default());
        });

        let result = run(tree).await;
        assert_eq!(entries(&log), vec!["first", "second", "generated"]);
        assert_eq!(result.total, 3);
        assert_eq!(result.records[2].full_name, "generated");
    }

    #[tokio::test]
    async fn test_nested_test_declaration_aborts_run() {
        let tree = TestTree::build(|b| {
            b.test("outer", |ctx| async move {
                ctx.add_test("inner")?;
                Ok(())
            });
            b.test("never", |_| async { Ok(()) });
        });

        let mut scheduler = Scheduler::new(tree, &EngineConfig::default()).unwrap();
        let events = scheduler.events().record();
        let err = scheduler.run().await.unwrap_err();

        assert!(matches!(err, EngineError::NestedDeclaration { .. }));
        assert!(!event_names(&events).iter().any(|e| e.starts_with("run_finish")));
    }

    #[tokio::test]
    async fn test_declaration_exception_is_a_failed_test() {
        let tree = TestTree::build(|b| {
            b.describe("broken", |_| anyhow::bail!("bad fixture"));
            b.test("fine", |_| async { Ok(()) });
        });

        let result = run(tree).await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.passed, 1);
        let record = result.record("broken declaration exception").unwrap();
        assert_eq!(record.errors, vec!["Describe callback failed: bad fixture"]);
    }

    #[tokio::test]
    async fn test_declaration_exception_fails_under_focus() {
        let tree = TestTree::build(|b| {
            b.describe("broken", |_| anyhow::bail!("bad fixture"));
            b.test_with("focused", TestOptions::only(), |_| async { Ok(()) });
        });

        let result = run(tree).await;
        let record = result.record("broken declaration exception").unwrap();
        assert_eq!(record.status, TestStatus::Failed);
        assert_eq!(result.passed, 1);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_declaration_exception_fails_under_name_pattern() {
        let tree = TestTree::build(|b| {
            b.describe("broken", |_| anyhow::bail!("bad fixture"));
            b.describe("math", |b| {
                b.test("adds", |_| async { Ok(()) });
                Ok(())
            });
        });

        let config = EngineConfig::default().with_name_pattern("^math ");
        let result = run_tree(tree, &config).await.unwrap();
        let record = result.record("broken declaration exception").unwrap();
        assert_eq!(record.status, TestStatus::Failed);
        assert_eq!(record.errors, vec!["Describe callback failed: bad fixture"]);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_declaration_exception_in_skipped_block_stays_skipped() {
        let tree = TestTree::build(|b| {
            b.describe_skip("parked", |b| {
                b.describe("broken", |_| anyhow::bail!("bad fixture"));
                Ok(())
            });
        });

        let result = run(tree).await;
        assert_eq!(result.skipped, 1);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_only_focuses_file() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.add_test("plain", log_test(&log, "plain"), TestOptions::default());
            b.add_test("focused", log_test(&log, "focused"), TestOptions::only());
            b.describe_only("focused block", |b| {
                b.add_test("inherits", log_test(&log, "inherits"), TestOptions::default());
                b.add_test("opted out", log_test(&log, "opted out"), TestOptions::skip());
                Ok(())
            });
        });

        let result = run(tree).await;
        assert_eq!(entries(&log), vec!["focused", "inherits"]);
        assert_eq!(result.skipped, 2);
    }

    #[tokio::test]
    async fn test_name_pattern_filters_tests() {
        let log = new_log();
        let tree = TestTree::build(|b| {
            b.describe("math", |b| {
                b.add_test("adds", log_test(&log, "adds"), TestOptions::default());
                Ok(())
            });
            b.add_test("strings", log_test(&log, "strings"), TestOptions::default());
        });

        let config = EngineConfig::default().with_name_pattern("^math ");
        let result = run_tree(tree, &config).await.unwrap();
        assert_eq!(entries(&log), vec!["adds"]);
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = EngineConfig::default().with_name_pattern("(unclosed");
        assert!(matches!(
            Scheduler::new(TestTree::new(), &config),
            Err(EngineError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_retries_until_pass() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let tree = TestTree::build(move |b| {
            b.test("flaky", move |ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    anyhow::ensure!(n > 0, "flaked on attempt {}", ctx.attempt());
                    Ok(())
                }
            });
        });

        let mut scheduler =
            Scheduler::new(tree, &EngineConfig::default().with_retries(2)).unwrap();
        let events = scheduler.events().record();
        let result = scheduler.run().await.unwrap();

        let record = &result.records[0];
        assert_eq!(record.status, TestStatus::Passed);
        assert_eq!(record.invocations, 2);
        assert_eq!(record.retry_reasons, vec!["flaked on attempt 1"]);
        assert!(event_names(&events).contains(&"test_retry:flaky#2".to_string()));
    }

    fn seeded_tree(log: &Log) -> TestTree {
        TestTree::build(|b| {
            for name in ["a", "b", "c", "d", "e", "f"] {
                b.add_test(name, log_test(log, name), TestOptions::default());
            }
        })
    }

    #[tokio::test]
    async fn test_seeded_shuffle_is_deterministic() {
        let (first, second) = (new_log(), new_log());
        let config = EngineConfig::default().with_seed(1234);

        let one = run_tree(seeded_tree(&first), &config).await.unwrap();
        let two = run_tree(seeded_tree(&second), &config).await.unwrap();

        assert_eq!(entries(&first), entries(&second));
        assert_eq!(one.seed, Some(1234));
        let mut sorted = entries(&first);
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b", "c", "d", "e", "f"]);
        // Records stay in declaration order
        assert_eq!(one.records[0].full_name, "a");
        let names = |result: &RunResult| -> Vec<String> {
            result.records.iter().map(|r| r.full_name.clone()).collect()
        };
        assert_eq!(names(&one), names(&two));
    }

    #[tokio::test]
    async fn test_repeated_runs_give_identical_results() {
        fn declare() -> TestTree {
            TestTree::build(|b| {
                b.describe("suite", |b| {
                    b.before_each(|_| async { Ok(()) });
                    b.test("ok", |_| async { Ok(()) });
                    b.test("bad", |_| async { anyhow::bail!("nope") });
                    b.todo("soon");
                    Ok(())
                });
            })
        }

        let stable = |result: RunResult| -> Vec<(String, TestStatus, Vec<String>)> {
            result
                .records
                .into_iter()
                .map(|r| (r.full_name, r.status, r.errors))
                .collect()
        };

        let first = stable(run(declare()).await);
        let second = stable(run(declare()).await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cancel_skips_remaining_tests() {
        let mut scheduler = Scheduler::new(TestTree::new(), &EngineConfig::default()).unwrap();
        let handle = scheduler.cancel_handle();

        scheduler.tree_mut().declare(|b| {
            b.test("cancels", move |_| {
                let handle = handle.clone();
                async move {
                    handle.cancel();
                    Ok(())
                }
            });
            b.test("after cancel", |_| async { Ok(()) });
        });

        let result = scheduler.run().await.unwrap();
        assert_eq!(result.records[0].status, TestStatus::Passed);
        assert_eq!(result.records[1].status, TestStatus::Skipped);
    }

    #[tokio::test]
    async fn test_stray_errors_attach_to_running_test_or_run() {
        let mut scheduler = Scheduler::new(TestTree::new(), &EngineConfig::default()).unwrap();
        let stray = scheduler.stray_errors();
        stray.report(anyhow::anyhow!("before anything ran"));

        let reporter = stray.clone();
        scheduler.tree_mut().declare(move |b| {
            b.test("leaks", move |_| {
                reporter.report(anyhow::anyhow!("background task died"));
                async { Ok(()) }
            });
        });

        let result = scheduler.run().await.unwrap();
        assert_eq!(result.records[0].status, TestStatus::Failed);
        assert_eq!(
            result.records[0].errors,
            vec!["Unhandled error: background task died"]
        );
        assert_eq!(result.run_errors, vec!["Unhandled error: before anything ran"]);
    }

    #[tokio::test]
    async fn test_stray_errors_from_each_hooks_attach_to_test() {
        let mut scheduler = Scheduler::new(TestTree::new(), &EngineConfig::default()).unwrap();
        let (before, after) = (scheduler.stray_errors(), scheduler.stray_errors());

        scheduler.tree_mut().declare(move |b| {
            b.before_each(move |_| {
                before.report(anyhow::anyhow!("leak in beforeEach"));
                async { Ok(()) }
            });
            b.after_each(move |_| {
                after.report(anyhow::anyhow!("leak in afterEach"));
                async { Ok(()) }
            });
            b.test("victim", |_| async { Ok(()) });
        });

        let result = scheduler.run().await.unwrap();
        assert_eq!(result.records[0].status, TestStatus::Failed);
        assert_eq!(
            result.records[0].errors,
            vec![
                "Unhandled error: leak in beforeEach",
                "Unhandled error: leak in afterEach"
            ]
        );
        assert!(result.run_errors.is_empty());
    }

    #[tokio::test]
    async fn test_tests_declared_by_after_all_are_never_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let tree = TestTree::build(move |b| {
            b.after_all(move |ctx| {
                let flag = flag.clone();
                ctx.add_test("too late", TestOptions::default(), move |_| {
                    flag.store(true, Ordering::SeqCst);
                    async { Ok(()) }
                });
                async { Ok(()) }
            });
            b.test("ok", |_| async { Ok(()) });
        });

        let result = run(tree).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(result.record("too late").unwrap().status, TestStatus::Skipped);
        assert_eq!(result.total, 2);
    }

    #[tokio::test]
    async fn test_after_all_failure_is_run_level() {
        let tree = TestTree::build(|b| {
            b.after_all(|_| async { anyhow::bail!("teardown failed") });
            b.test("ok", |_| async { Ok(()) });
        });

        let result = run(tree).await;
        assert_eq!(result.passed, 1);
        assert_eq!(result.run_errors, vec!["afterAll hook failed: teardown failed"]);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_empty_and_fully_skipped_runs_complete() {
        let empty = run(TestTree::new()).await;
        assert_eq!(empty.total, 0);

        let log = new_log();
        let tree = TestTree::build(|b| {
            b.add_hook(HookKind::BeforeAll, log_hook(&log, "beforeAll"), None);
            b.add_test("off", log_test(&log, "off"), TestOptions::skip());
        });
        let skipped = run(tree).await;
        assert_eq!(skipped.skipped, 1);
        assert!(entries(&log).is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_shared_hooks_once_each_hooks_per_test(
            groups in proptest::collection::vec(0usize..4, 1..5)
        ) {
            let before_all = Arc::new(AtomicUsize::new(0));
            let before_each = Arc::new(AtomicUsize::new(0));
            let (all, each) = (before_all.clone(), before_each.clone());

            let tree = TestTree::build(move |b| {
                b.before_all(move |_| {
                    all.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                });
                b.before_each(move |_| {
                    each.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                });
                for (index, count) in groups.iter().enumerate() {
                    b.describe(format!("group {index}"), |b| {
                        for n in 0..*count {
                            b.test(format!("test {n}"), |_| async { Ok(()) });
                        }
                        Ok(())
                    });
                }
            });
            let expected: usize = tree.test_count();

            let result = tokio_test::block_on(run(tree));
            proptest::prop_assert_eq!(result.passed, expected);
            proptest::prop_assert_eq!(before_each.load(Ordering::SeqCst), expected);
            proptest::prop_assert_eq!(before_all.load(Ordering::SeqCst), usize::from(expected > 0));
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_once() {
        let mut scheduler = Scheduler::new(TestTree::new(), &EngineConfig::default()).unwrap();
        scheduler.run().await.unwrap();
        assert_eq!(scheduler.run().await.unwrap_err(), EngineError::AlreadyRan);
    }
}
