//! Hook resolution
//!
//! Computes the hooks that surround a test and keeps the at-most-once record
//! for `beforeAll`/`afterAll`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::{BlockId, HookId, HookKind, TestId, TestTree};

/// Hooks surrounding one test
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedHooks {
    /// Outermost block first, declaration order within a block
    pub before: Vec<HookId>,
    /// Innermost block first, declaration order within a block
    pub after: Vec<HookId>,
}

pub struct HookResolver<'t> {
    tree: &'t TestTree,
}

impl<'t> HookResolver<'t> {
    pub fn new(tree: &'t TestTree) -> Self {
        Self { tree }
    }

    pub fn resolve(&self, test: TestId) -> ResolvedHooks {
        let mut resolved = ResolvedHooks::default();

        for block in self.tree.ancestors(self.tree.test(test).parent) {
            let before_start = resolved.before.len();
            for &hook in &self.tree.block(block).hooks {
                if self.tree.hook(hook).kind.is_before() {
                    resolved.before.push(hook);
                } else {
                    resolved.after.push(hook);
                }
            }
            // Undone by the final reverse below, keeping declaration order per block
            resolved.before[before_start..].reverse();
        }

        resolved.before.reverse();
        resolved
    }

    /// Hooks of one kind declared directly on `block`
    pub fn block_hooks(&self, block: BlockId, kind: HookKind) -> Vec<HookId> {
        self.tree
            .block(block)
            .hooks
            .iter()
            .copied()
            .filter(|hook| self.tree.hook(*hook).kind == kind)
            .collect()
    }
}

/// Shared hooks that already ran in this pass
#[derive(Clone, Debug, Default)]
pub struct SharedHookRecord {
    ran: Arc<Mutex<HashSet<HookId>>>,
}

impl SharedHookRecord {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<HookId>> {
        self.ran.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `hook` as run; false when it already was
    pub fn claim(&self, hook: HookId) -> bool {
        self.lock().insert(hook)
    }

    pub fn has_run(&self, hook: HookId) -> bool {
        self.lock().contains(&hook)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
