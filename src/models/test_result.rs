//! Test result models
//!
//! Flattened per-test records and the run-level result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::tree::RunState;

/// Final status of a test
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::Passed => "✓",
            TestStatus::Failed => "✗",
            TestStatus::Skipped => "○",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }
}

impl From<RunState> for TestStatus {
    /// Tests the scheduler never reached count as skipped
    fn from(state: RunState) -> Self {
        match state {
            RunState::Passed => TestStatus::Passed,
            RunState::Failed => TestStatus::Failed,
            RunState::Skipped | RunState::NotStarted | RunState::Running => TestStatus::Skipped,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "PASS"),
            TestStatus::Failed => write!(f, "FAIL"),
            TestStatus::Skipped => write!(f, "SKIP"),
        }
    }
}

/// Result of a single test, as seen by consumers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub ancestor_titles: Vec<String>,
    pub title: String,
    pub full_name: String,
    pub status: TestStatus,
    pub todo: bool,
    pub duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub retry_reasons: Vec<String>,
    pub invocations: u32,
}

impl fmt::Display for TestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.status.symbol(),
            self.full_name,
            self.duration_ms
        )?;
        if self.todo {
            write!(f, " (todo)")?;
        }
        for error in &self.errors {
            write!(f, "\n    {error}")?;
        }
        Ok(())
    }
}

/// Aggregated result of one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub todo: usize,
    pub seed: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Pre-order over the tree
    pub records: Vec<TestRecord>,
    /// afterAll failures and stray errors with no active test
    pub run_errors: Vec<String>,
}

impl RunResult {
    pub fn new(
        records: Vec<TestRecord>,
        run_errors: Vec<String>,
        seed: Option<u64>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        let total = records.len();
        let passed = records
            .iter()
            .filter(|r| r.status == TestStatus::Passed)
            .count();
        let failed = records
            .iter()
            .filter(|r| r.status == TestStatus::Failed)
            .count();
        let skipped = records
            .iter()
            .filter(|r| r.status == TestStatus::Skipped)
            .count();
        let todo = records.iter().filter(|r| r.todo).count();

        Self {
            total,
            passed,
            failed,
            skipped,
            todo,
            seed,
            started_at,
            duration_ms,
            records,
            run_errors,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        let ran = self.passed + self.failed;
        if ran == 0 {
            0.0
        } else {
            (self.passed as f64 / ran as f64) * 100.0
        }
    }

    /// No failed test and no run-level error
    pub fn success(&self) -> bool {
        self.failed == 0 && self.run_errors.is_empty()
    }

    pub fn record(&self, full_name: &str) -> Option<&TestRecord> {
        self.records.iter().find(|r| r.full_name == full_name)
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for record in &self.records {
            writeln!(f, "  {record}")?;
        }
        for error in &self.run_errors {
            writeln!(f, "  ! {error}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Skip: {} | Todo: {}",
            self.total, self.passed, self.failed, self.skipped, self.todo
        )?;
        write!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.duration_ms
        )?;
        if let Some(seed) = self.seed {
            write!(f, " | Seed: {seed}")?;
        }
        writeln!(f)
    }
}
