//! Lifecycle events
//!
//! The scheduler raises [`Event`]s and the [`EventDispatcher`] hands each one
//! to every matching subscriber synchronously, in the order raised.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::models::{BlockId, HookId, HookKind, RunResult, TestError, TestId};

/// Hook identity carried on hook events
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookInfo {
    pub hook: HookId,
    pub kind: HookKind,
    pub block_name: String,
    /// Test the hook ran for, `None` for block-level hooks
    pub test: Option<String>,
}

#[derive(Clone, Debug)]
pub enum Event {
    RunStart {
        test_count: usize,
        seed: Option<u64>,
    },
    BlockStart {
        block: BlockId,
        name: String,
        path: Vec<String>,
    },
    BlockEnd {
        block: BlockId,
        name: String,
        path: Vec<String>,
    },
    HookStart(HookInfo),
    HookSuccess(HookInfo),
    HookFailure {
        hook: HookInfo,
        error: TestError,
    },
    TestStart {
        test: TestId,
        full_name: String,
    },
    /// Emitted before attempt number `attempt` (2 and up)
    TestRetry {
        test: TestId,
        full_name: String,
        attempt: u32,
        reasons: Vec<TestError>,
    },
    TestSuccess {
        test: TestId,
        full_name: String,
        duration: Duration,
    },
    TestFailure {
        test: TestId,
        full_name: String,
        errors: Vec<TestError>,
        duration: Duration,
    },
    TestSkip {
        test: TestId,
        full_name: String,
        todo: bool,
    },
    RunFinish {
        result: Box<RunResult>,
    },
}

/// Discriminant of [`Event`], used for subscriptions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    RunStart,
    BlockStart,
    BlockEnd,
    HookStart,
    HookSuccess,
    HookFailure,
    TestStart,
    TestRetry,
    TestSuccess,
    TestFailure,
    TestSkip,
    RunFinish,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RunStart { .. } => EventKind::RunStart,
            Event::BlockStart { .. } => EventKind::BlockStart,
            Event::BlockEnd { .. } => EventKind::BlockEnd,
            Event::HookStart(_) => EventKind::HookStart,
            Event::HookSuccess(_) => EventKind::HookSuccess,
            Event::HookFailure { .. } => EventKind::HookFailure,
            Event::TestStart { .. } => EventKind::TestStart,
            Event::TestRetry { .. } => EventKind::TestRetry,
            Event::TestSuccess { .. } => EventKind::TestSuccess,
            Event::TestFailure { .. } => EventKind::TestFailure,
            Event::TestSkip { .. } => EventKind::TestSkip,
            Event::RunFinish { .. } => EventKind::RunFinish,
        }
    }
}

impl fmt::Display for Event {
    /// Short form used in logs and ordering assertions
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::RunStart { test_count, .. } => write!(f, "run_start({test_count})"),
            Event::BlockStart { name, .. } => write!(f, "block_start:{name}"),
            Event::BlockEnd { name, .. } => write!(f, "block_end:{name}"),
            Event::HookStart(info) => write!(f, "hook_start:{}", info.kind),
            Event::HookSuccess(info) => write!(f, "hook_success:{}", info.kind),
            Event::HookFailure { hook, .. } => write!(f, "hook_failure:{}", hook.kind),
            Event::TestStart { full_name, .. } => write!(f, "test_start:{full_name}"),
            Event::TestRetry {
                full_name, attempt, ..
            } => write!(f, "test_retry:{full_name}#{attempt}"),
            Event::TestSuccess { full_name, .. } => write!(f, "test_success:{full_name}"),
            Event::TestFailure { full_name, .. } => write!(f, "test_failure:{full_name}"),
            Event::TestSkip { full_name, .. } => write!(f, "test_skip:{full_name}"),
            Event::RunFinish { result } => write!(f, "run_finish({})", result.total),
        }
    }
}

type Callback = Box<dyn FnMut(&Event) + Send>;

struct Subscriber {
    filter: Option<EventKind>,
    callback: Callback,
}

/// Ordered list of subscribers, shared by clones
///
/// Callbacks run while the subscriber list is locked, so a callback must not
/// emit or subscribe through the same dispatcher.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive events of one kind
    pub fn subscribe<F>(&self, kind: EventKind, callback: F)
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.lock().push(Subscriber {
            filter: Some(kind),
            callback: Box::new(callback),
        });
    }

    /// Receive every event
    pub fn subscribe_all<F>(&self, callback: F)
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.lock().push(Subscriber {
            filter: None,
            callback: Box::new(callback),
        });
    }

    /// Collect every event into a shared list
    pub fn record(&self) -> Arc<Mutex<Vec<Event>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        self.subscribe_all(move |event| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        });
        log
    }

    pub fn emit(&self, event: &Event) {
        trace!("event {}", event);
        let kind = event.kind();
        for subscriber in self.lock().iter_mut() {
            if subscriber.filter.map_or(true, |filter| filter == kind) {
                (subscriber.callback)(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}
