//! Cooperative tasks
//!
//! A task body is a resumable step function. Each `resume` runs one slice on
//! a carrier and reports how the task wants to continue: yield, sleep, park
//! or finish. This stands in for a coroutine's yield points.

use crate::container::{CarrierSlot, ResourceContainer, SchedulerContext};
use crate::quota::TaskAccount;
use crate::timer::TimerId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::SchedulerError;

/// How a task continues after a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Go to the back of the run queue
    Yield,
    /// Become runnable again after this many nanoseconds
    Sleep(i64),
    /// Wait for `unpark`, or until the deadline if one is given
    Park { deadline_ns: Option<i64> },
    /// The task is finished
    Done,
}

impl Step {
    pub fn sleep(duration: Duration) -> Self {
        Step::Sleep(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }

    pub fn park() -> Self {
        Step::Park { deadline_ns: None }
    }
}

/// Body of a cooperative task
pub trait TaskBody: Send {
    fn resume(&mut self, cx: &mut TaskContext<'_>) -> Step;
}

impl<F> TaskBody for F
where
    F: FnMut(&mut TaskContext<'_>) -> Step + Send,
{
    fn resume(&mut self, cx: &mut TaskContext<'_>) -> Step {
        self(cx)
    }
}

/// What a task can see while it runs
pub struct TaskContext<'a> {
    pub(crate) task_id: u64,
    pub(crate) carrier: &'a CarrierSlot,
    pub(crate) ctx: &'a SchedulerContext,
    pub(crate) timed_out: bool,
}

impl TaskContext<'_> {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn carrier(&self) -> &CarrierSlot {
        self.carrier
    }

    pub fn context(&self) -> &SchedulerContext {
        self.ctx
    }

    pub fn now_ns(&self) -> i64 {
        self.ctx.clock().now_ns()
    }

    /// Id of the container this slice runs in
    pub fn container_id(&self) -> u64 {
        self.carrier.current_container_id()
    }

    /// True if the task was resumed because its park deadline passed
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

/// Final result of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TaskState {
    Runnable = 0,
    Running = 1,
    Sleeping = 2,
    Parked = 3,
    Done = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::Sleeping,
            3 => TaskState::Parked,
            _ => TaskState::Done,
        }
    }
}

/// Scheduler-owned task record
///
/// State transitions happen under the pool's queue lock.
pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) container: Arc<ResourceContainer>,
    pub(crate) account: Arc<TaskAccount>,
    pub(crate) body: Mutex<Box<dyn TaskBody>>,
    pub(crate) timer: Mutex<Option<TimerId>>,
    pub(crate) timed_out: AtomicBool,
    pub(crate) unpark_permit: AtomicBool,
    state: AtomicU8,
    outcome: Mutex<Option<TaskOutcome>>,
    done: Condvar,
}

impl Task {
    pub(crate) fn new(id: u64, container: Arc<ResourceContainer>, body: Box<dyn TaskBody>) -> Self {
        Self {
            id,
            container,
            account: Arc::new(TaskAccount::new()),
            body: Mutex::new(body),
            timer: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            unpark_permit: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Runnable as u8),
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record the outcome once and wake joiners; later calls are ignored
    pub(crate) fn complete(&self, outcome: TaskOutcome) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.set_state(TaskState::Done);
        self.done.notify_all();
        true
    }
}

/// Handle to a spawned task
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) task: Arc<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.task.id
    }

    pub fn container_id(&self) -> u64 {
        self.task.container.id()
    }

    pub fn is_finished(&self) -> bool {
        self.task.outcome.lock().is_some()
    }

    /// Run time accumulated outside any quota group
    pub fn total_ts(&self) -> i64 {
        self.task.account.total_ts()
    }

    /// Delay computed by the task's last rejected admission
    pub fn time_to_resume(&self) -> i64 {
        self.task.account.time_to_resume()
    }

    /// Wait for the task to finish
    pub fn join(&self, timeout: Duration) -> Result<TaskOutcome, SchedulerError> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.task.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return Ok(outcome.clone());
            }
            if self.task.done.wait_until(&mut outcome, deadline).timed_out() {
                return outcome
                    .clone()
                    .ok_or(SchedulerError::JoinTimeout(self.task.id));
            }
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.task.id)
            .field("container_id", &self.task.container.id())
            .field("state", &self.task.state())
            .finish()
    }
}
