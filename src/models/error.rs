//! Error types
//!
//! [`TestError`] is a contained failure that ends up on a test record.
//! [`EngineError`] aborts the whole run.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::tree::HookKind;

/// Fatal engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Tests cannot be nested: \"{test}\" was declared while \"{running}\" was running")]
    NestedDeclaration { test: String, running: String },

    #[error("exit_block called with no open describe block")]
    ExitRootBlock,

    #[error("Invalid test name pattern \"{pattern}\": {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Scheduler has already run; build a fresh tree for every run")]
    AlreadyRan,
}

/// Where a contained failure came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Describe callback returned an error or panicked
    Declaration,
    Hook(HookKind),
    Test,
    Timeout,
    /// Reported through the stray error handle
    Unhandled,
    Cancelled,
}

/// Failure recorded against a test, or against the run when nothing is active
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestError {
    pub kind: FailureKind,
    pub message: String,
}

impl TestError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn declaration(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Declaration, message)
    }

    pub fn hook(kind: HookKind, err: &anyhow::Error) -> Self {
        Self::new(FailureKind::Hook(kind), format!("{err:#}"))
    }

    pub fn test(err: &anyhow::Error) -> Self {
        Self::new(FailureKind::Test, format!("{err:#}"))
    }

    /// `unit` is "test" or "hook"
    pub fn timeout(unit: &str, timeout: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!(
                "Exceeded timeout of {} ms for a {unit}.",
                timeout.as_millis()
            ),
        )
    }

    pub fn unhandled(err: &anyhow::Error) -> Self {
        Self::new(FailureKind::Unhandled, format!("{err:#}"))
    }

    pub fn cancelled(unit: &str) -> Self {
        Self::new(
            FailureKind::Cancelled,
            format!("Run was cancelled before the {unit} settled"),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Declaration => write!(f, "Describe callback failed: {}", self.message),
            FailureKind::Hook(kind) => write!(f, "{kind} hook failed: {}", self.message),
            FailureKind::Test | FailureKind::Timeout | FailureKind::Cancelled => {
                f.write_str(&self.message)
            }
            FailureKind::Unhandled => write!(f, "Unhandled error: {}", self.message),
        }
    }
}

impl std::error::Error for TestError {}

/// Render a caught panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}
