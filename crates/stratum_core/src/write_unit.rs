//! Write units with commit and rollback hooks.

use std::fmt;

type Hook = Box<dyn FnOnce() + Send>;

/// State of a write unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Hooks may still be registered.
    Active,
    /// Commit hooks ran.
    Committed,
    /// Rollback hooks ran.
    RolledBack,
}

/// A scope of work whose side effects are undone unless it commits.
///
/// Rollback hooks run in reverse registration order when the unit is rolled
/// back or dropped without committing. Commit hooks run in registration order.
///
/// # Example
///
/// ```rust
/// use stratum_core::WriteUnitOfWork;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let undone = Arc::new(AtomicBool::new(false));
/// {
///     let mut unit = WriteUnitOfWork::new();
///     let flag = Arc::clone(&undone);
///     unit.on_rollback(move || flag.store(true, Ordering::SeqCst));
/// }
/// assert!(undone.load(Ordering::SeqCst));
/// ```
pub struct WriteUnitOfWork {
    state: UnitState,
    on_commit: Vec<Hook>,
    on_rollback: Vec<Hook>,
}

impl WriteUnitOfWork {
    /// Starts a new unit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: UnitState::Active,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    /// Returns the unit's state.
    #[must_use]
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Registers a hook to run on commit.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    /// Registers a hook to run on rollback.
    pub fn on_rollback(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_rollback.push(Box::new(hook));
    }

    /// Commits the unit, discarding rollback hooks.
    pub fn commit(mut self) {
        self.on_rollback.clear();
        for hook in self.on_commit.drain(..) {
            hook();
        }
        self.state = UnitState::Committed;
    }

    /// Rolls the unit back explicitly.
    pub fn rollback(mut self) {
        self.run_rollback();
    }

    fn run_rollback(&mut self) {
        self.on_commit.clear();
        while let Some(hook) = self.on_rollback.pop() {
            hook();
        }
        self.state = UnitState::RolledBack;
    }
}

impl Default for WriteUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriteUnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteUnitOfWork")
            .field("state", &self.state)
            .field("on_commit", &self.on_commit.len())
            .field("on_rollback", &self.on_rollback.len())
            .finish()
    }
}

impl Drop for WriteUnitOfWork {
    fn drop(&mut self) {
        if self.state == UnitState::Active {
            self.run_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn rollback_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut unit = WriteUnitOfWork::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            unit.on_rollback(move || order.lock().push(i));
        }
        unit.rollback();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn commit_skips_rollback_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut unit = WriteUnitOfWork::new();
        let l = Arc::clone(&log);
        unit.on_rollback(move || l.lock().push("rollback"));
        let l = Arc::clone(&log);
        unit.on_commit(move || l.lock().push("commit"));
        unit.commit();
        assert_eq!(*log.lock(), vec!["commit"]);
    }

    #[test]
    fn drop_rolls_back() {
        let log = Arc::new(Mutex::new(0));
        {
            let mut unit = WriteUnitOfWork::new();
            let l = Arc::clone(&log);
            unit.on_rollback(move || *l.lock() += 1);
            assert_eq!(unit.state(), UnitState::Active);
        }
        assert_eq!(*log.lock(), 1);
    }
}
