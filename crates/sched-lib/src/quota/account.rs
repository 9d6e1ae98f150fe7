//! Per-task CPU accounting state

use super::CpuQuotaGroup;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// Accounting fields a quota group reads and writes on a task
///
/// `enter_ts == 0` means the task's running time is not currently being
/// attributed to anything. The group back-reference is weak: a task never
/// keeps its group alive.
#[derive(Debug, Default)]
pub struct TaskAccount {
    enter_ts: AtomicI64,
    total_ts: AtomicI64,
    time_to_resume: AtomicI64,
    group: Mutex<Weak<CpuQuotaGroup>>,
}

impl TaskAccount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp accounting began, or 0
    pub fn enter_ts(&self) -> i64 {
        self.enter_ts.load(Ordering::Acquire)
    }

    /// Run time accumulated outside any quota group
    pub fn total_ts(&self) -> i64 {
        self.total_ts.load(Ordering::Acquire)
    }

    /// Delay computed by the last rejected admission
    pub fn time_to_resume(&self) -> i64 {
        self.time_to_resume.load(Ordering::Acquire)
    }

    pub(crate) fn set_enter_ts(&self, ts: i64) {
        self.enter_ts.store(ts, Ordering::Release);
    }

    pub(crate) fn take_enter_ts(&self) -> i64 {
        self.enter_ts.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn set_time_to_resume(&self, ns: i64) {
        self.time_to_resume.store(ns, Ordering::Release);
    }

    /// Start attributing run time outside any group
    pub fn stamp(&self, now: i64) {
        self.set_enter_ts(now);
    }

    /// Fold unattributed time since `enter_ts` into `total_ts`
    ///
    /// Returns the folded amount; a task with `enter_ts == 0` folds nothing.
    pub fn fold_unattributed(&self, now: i64) -> i64 {
        let enter = self.take_enter_ts();
        if enter == 0 {
            return 0;
        }
        let elapsed = (now - enter).max(0);
        self.total_ts.fetch_add(elapsed, Ordering::AcqRel);
        elapsed
    }

    /// Group the task is currently bound to, if it is still alive
    pub fn group(&self) -> Option<Arc<CpuQuotaGroup>> {
        self.group.lock().upgrade()
    }

    pub fn is_bound_to(&self, group: &Arc<CpuQuotaGroup>) -> bool {
        std::ptr::eq(self.group.lock().as_ptr(), Arc::as_ptr(group))
    }

    pub(crate) fn bind(&self, group: &Arc<CpuQuotaGroup>) {
        *self.group.lock() = Arc::downgrade(group);
    }

    pub(crate) fn unbind(&self) {
        *self.group.lock() = Weak::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_unattributed() {
        let account = TaskAccount::new();
        assert_eq!(account.fold_unattributed(100), 0);

        account.stamp(100);
        assert_eq!(account.fold_unattributed(350), 250);
        assert_eq!(account.enter_ts(), 0);
        assert_eq!(account.total_ts(), 250);

        account.stamp(400);
        account.fold_unattributed(500);
        assert_eq!(account.total_ts(), 350);
    }

    #[test]
    fn test_group_reference_is_weak() {
        let account = TaskAccount::new();
        let group = Arc::new(CpuQuotaGroup::new(10, 100).unwrap());
        account.bind(&group);
        assert!(account.is_bound_to(&group));
        assert!(account.group().is_some());

        drop(group);
        assert!(account.group().is_none());

        account.unbind();
        assert!(account.group().is_none());
    }
}
