//! CPU quota control groups
//!
//! A [`CpuQuotaGroup`] is a CFS-like token bucket: each accounting window of
//! `period_ns` grants `quota_ns` of CPU time to the tasks bound to it.
//!
//! ## Algorithm
//!
//! ```text
//! admission (check_and_maybe_delay):
//!   if now > period_start + period:
//!       CAS period_start -> now
//!       remaining = min(remaining + (now - old_start) * quota / period, quota)
//!   if remaining >= 0:
//!       task.enter_ts = now          // admitted
//!       return 0
//!   delay = ceil(-remaining * period / quota)
//!   delay = max(delay, period_start + period - now)
//!   return delay
//!
//! accounting (account_usage):
//!   remaining -= now - task.enter_ts  // may go negative (debt)
//! ```
//!
//! Credit is prorated by elapsed time instead of reset at each boundary, and
//! banked credit never exceeds one period's quota. Both steps are single CAS
//! operations on atomics; a lost race simply retries with fresh values.

mod account;


pub use account::TaskAccount;

use crate::clock::{Clock, MonotonicClock};
use crate::config::SchedulerConfig;
use crate::error::QuotaError;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Token bucket limiting the CPU time of the tasks bound to it
pub struct CpuQuotaGroup {
    quota_ns: i64,
    period_ns: i64,
    period_start: AtomicI64,
    remaining: AtomicI64,
    consumed_ns: AtomicI64,
    limit_reached: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl CpuQuotaGroup {
    /// Create a group on the monotonic clock
    pub fn new(quota_ns: i64, period_ns: i64) -> Result<Self, QuotaError> {
        Self::with_clock(quota_ns, period_ns, Arc::new(MonotonicClock::new()))
    }

    /// Create a group on an explicit clock; the first window starts now
    pub fn with_clock(
        quota_ns: i64,
        period_ns: i64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QuotaError> {
        if quota_ns <= 0 || period_ns <= 0 {
            return Err(QuotaError::NonPositive {
                quota_ns,
                period_ns,
            });
        }
        let now = clock.now_ns();
        Ok(Self {
            quota_ns,
            period_ns,
            period_start: AtomicI64::new(now),
            remaining: AtomicI64::new(quota_ns),
            consumed_ns: AtomicI64::new(0),
            limit_reached: AtomicU64::new(0),
            clock,
        })
    }

    /// Create a group for a CPU percentage using the configured period clamps
    pub fn from_percent(
        percent: i64,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QuotaError> {
        let (quota_ns, period_ns) = config.quota_for_percent(percent);
        debug!(percent, quota_ns, period_ns, "Creating CPU quota group");
        Self::with_clock(quota_ns, period_ns, clock)
    }

    pub fn quota_ns(&self) -> i64 {
        self.quota_ns
    }

    pub fn period_ns(&self) -> i64 {
        self.period_ns
    }

    /// Remaining budget in the current window; negative means debt
    pub fn remaining_ns(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn period_start(&self) -> i64 {
        self.period_start.load(Ordering::Acquire)
    }

    /// Total CPU time accounted to this group
    pub fn consumed_ns(&self) -> i64 {
        self.consumed_ns.load(Ordering::Acquire)
    }

    /// Number of admissions that were rejected with a delay
    pub fn limit_reached_count(&self) -> u64 {
        self.limit_reached.load(Ordering::Acquire)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Decide whether `task` may run now
    ///
    /// Returns 0 when admitted (and stamps `enter_ts`), otherwise the delay in
    /// nanoseconds before the task may run. With `update_timestamp` set, a
    /// rejected task is stamped as well, so its caller must still pair this
    /// call with [`account_usage`](Self::account_usage).
    pub fn check_and_maybe_delay(&self, task: &TaskAccount, update_timestamp: bool) -> i64 {
        debug_assert_eq!(task.enter_ts(), 0, "task is already attributed to a group");

        let now = self.clock.now_ns();
        self.refill(now);

        let remaining = self.remaining.load(Ordering::Acquire);
        if remaining >= 0 {
            task.set_enter_ts(now);
            task.set_time_to_resume(0);
            return 0;
        }

        let debt = -(remaining as i128);
        let quota = self.quota_ns as i128;
        let repay = (debt * self.period_ns as i128 + quota - 1) / quota;
        let boundary = self.period_start.load(Ordering::Acquire) + self.period_ns - now;
        let delay = (repay.min(i64::MAX as i128) as i64).max(boundary).max(1);

        task.set_time_to_resume(delay);
        self.limit_reached.fetch_add(1, Ordering::AcqRel);
        if update_timestamp {
            task.set_enter_ts(now);
        }
        trace!(remaining, delay_ns = delay, "CPU quota exhausted");
        delay
    }

    /// Charge the time since `task.enter_ts` to the group
    ///
    /// Clears `enter_ts` and returns the usage. The budget may go negative;
    /// the debt is repaid by later refills.
    pub fn account_usage(&self, task: &TaskAccount) -> i64 {
        debug_assert_ne!(task.enter_ts(), 0, "task is not attributed to a group");

        let enter = task.take_enter_ts();
        if enter == 0 {
            return 0;
        }
        let usage = (self.clock.now_ns() - enter).max(0);
        self.remaining.fetch_sub(usage, Ordering::AcqRel);
        self.consumed_ns.fetch_add(usage, Ordering::AcqRel);
        usage
    }

    /// Bind `task` to this group, blocking the caller while the group is in debt
    ///
    /// Time the task spent running outside any group is folded into
    /// `total_ts` first. Admission stamps the task even when rejected, and the
    /// stamp is moved to the wake-up time so the wait is not billed. Always
    /// pair with [`detach_current`](Self::detach_current).
    pub fn attach_current(self: &Arc<Self>, task: &TaskAccount) -> i64 {
        let now = self.clock.now_ns();
        task.fold_unattributed(now);

        let delay = self.check_and_maybe_delay(task, true);
        task.bind(self);
        if delay > 0 {
            debug!(delay_ns = delay, "Parking carrier until quota refills");
            self.clock.park_for(delay);
            task.set_enter_ts(self.clock.now_ns());
        }
        delay
    }

    /// Account the task's usage and drop its binding to this group
    pub fn detach_current(&self, task: &TaskAccount) -> i64 {
        let usage = self.account_usage(task);
        task.unbind();
        usage
    }

    fn refill(&self, now: i64) {
        loop {
            let start = self.period_start.load(Ordering::Acquire);
            if now <= start + self.period_ns {
                return;
            }
            if self
                .period_start
                .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let elapsed = (now - start) as i128;
            let credit = (elapsed * self.quota_ns as i128 / self.period_ns as i128)
                .min(i64::MAX as i128) as i64;
            let quota = self.quota_ns;
            let _ = self
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                    Some(remaining.saturating_add(credit).min(quota))
                });
            return;
        }
    }
}

impl fmt::Debug for CpuQuotaGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuQuotaGroup")
            .field("quota_ns", &self.quota_ns)
            .field("period_ns", &self.period_ns)
            .field("period_start", &self.period_start())
            .field("remaining", &self.remaining_ns())
            .field("consumed_ns", &self.consumed_ns())
            .finish()
    }
}
