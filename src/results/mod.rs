//! Result aggregation
//!
//! Flattens a completed tree into one [`TestRecord`] per test, pre-order.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::{
    BlockId, Child, RunResult, RunState, TestError, TestId, TestRecord, TestTree,
};

/// Builds the run result from a completed tree
pub struct ResultAggregator<'t> {
    tree: &'t TestTree,
}

impl<'t> ResultAggregator<'t> {
    pub fn new(tree: &'t TestTree) -> Self {
        Self { tree }
    }

    /// One record per test in pre-order over the tree
    pub fn records(&self) -> Vec<TestRecord> {
        let mut records = Vec::with_capacity(self.tree.test_count());
        self.visit(self.tree.root(), &mut records);
        records
    }

    fn visit(&self, block: BlockId, out: &mut Vec<TestRecord>) {
        for child in &self.tree.block(block).children {
            match child {
                Child::Test(test) => out.push(self.record(*test)),
                Child::Block(nested) => self.visit(*nested, out),
            }
        }
    }

    fn record(&self, id: TestId) -> TestRecord {
        let test = self.tree.test(id);
        if matches!(test.state, RunState::NotStarted | RunState::Running) {
            warn!(
                "\"{}\" was never reached by the run; reporting it as skipped",
                self.tree.full_name(id)
            );
        }
        TestRecord {
            ancestor_titles: self.tree.ancestor_titles(id),
            title: test.name.clone(),
            full_name: self.tree.full_name(id),
            status: test.state.into(),
            todo: test.is_todo(),
            duration_ms: test
                .duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            started_at: test.started_at,
            errors: format_errors(&test.errors),
            retry_reasons: format_errors(&test.retry_reasons),
            invocations: test.invocations,
        }
    }

    pub fn aggregate(
        &self,
        run_errors: &[TestError],
        seed: Option<u64>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> RunResult {
        RunResult::new(
            self.records(),
            format_errors(run_errors),
            seed,
            started_at,
            duration_ms,
        )
    }
}

fn format_errors(errors: &[TestError]) -> Vec<String> {
    errors.iter().map(ToString::to_string).collect()
}
