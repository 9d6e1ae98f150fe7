//! Carrier pool
//!
//! A fixed set of carrier threads sharing one run queue and one timer queue.
//! A task rejected by its container's quota group is parked on a `Wake`
//! timer instead of blocking the carrier, so one throttled container never
//! starves the others.

use super::task::{Step, Task, TaskBody, TaskContext, TaskHandle, TaskOutcome, TaskState};
use crate::container::{CarrierSlot, ResourceContainer, SchedulerContext};
use crate::error::SchedulerError;
use crate::models::PoolStats;
use crate::timer::{TimerAction, TimerQueue};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace};

struct RunQueue {
    runnable: VecDeque<Arc<Task>>,
    timers: TimerQueue<Arc<Task>>,
    shutdown: bool,
}

struct PoolShared {
    ctx: Arc<SchedulerContext>,
    queue: Mutex<RunQueue>,
    wakeup: Condvar,
    tasks: DashMap<u64, Arc<Task>>,
    next_task_id: AtomicU64,
    completed: AtomicU64,
    quota_delays: AtomicU64,
}

/// Fixed-size pool of carrier threads
pub struct CarrierPool {
    shared: Arc<PoolShared>,
    carriers: Mutex<Vec<JoinHandle<()>>>,
    carrier_count: usize,
}

impl CarrierPool {
    /// Spawn `ctx.config().carriers` carrier threads
    pub fn start(ctx: Arc<SchedulerContext>) -> Result<Self, SchedulerError> {
        let carrier_count = ctx.config().carriers.max(1);
        let shared = Arc::new(PoolShared {
            ctx,
            queue: Mutex::new(RunQueue {
                runnable: VecDeque::new(),
                timers: TimerQueue::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            tasks: DashMap::new(),
            next_task_id: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            quota_delays: AtomicU64::new(0),
        });

        let pool = Self {
            shared: shared.clone(),
            carriers: Mutex::new(Vec::with_capacity(carrier_count)),
            carrier_count,
        };

        for index in 0..carrier_count {
            let worker = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("carrier-{}-{index}", shared.ctx.id()))
                .spawn(move || worker.carrier_main())
                .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
            pool.carriers.lock().push(handle);
        }

        info!(
            context_id = shared.ctx.id(),
            carriers = carrier_count,
            "Carrier pool started"
        );
        Ok(pool)
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.shared.ctx
    }

    /// Queue a new task in `container`
    pub fn spawn<B>(&self, container: &Arc<ResourceContainer>, body: B) -> Result<TaskHandle, SchedulerError>
    where
        B: TaskBody + 'static,
    {
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Task::new(id, container.clone(), Box::new(body)));

        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(SchedulerError::ShutDown);
            }
            self.shared.tasks.insert(id, task.clone());
            queue.runnable.push_back(task.clone());
        }
        self.shared.wakeup.notify_one();
        self.shared.ctx.metrics().inc_tasks_spawned();
        trace!(task_id = id, container_id = container.id(), "Task spawned");

        Ok(TaskHandle { task })
    }

    /// Wake a parked task
    ///
    /// A pending park timeout is cancelled. Returns `false` when the task
    /// was not parked; the wake-up is then kept as a permit and consumed by
    /// the task's next park.
    pub fn unpark(&self, task_id: u64) -> Result<bool, SchedulerError> {
        let task = self
            .shared
            .tasks
            .get(&task_id)
            .map(|r| r.value().clone())
            .ok_or(SchedulerError::UnknownTask(task_id))?;

        let mut queue = self.shared.queue.lock();
        match task.state() {
            TaskState::Parked => {
                if let Some(timer) = task.timer.lock().take() {
                    queue.timers.remove(timer);
                }
                task.set_state(TaskState::Runnable);
                queue.runnable.push_back(task.clone());
                drop(queue);
                self.shared.wakeup.notify_one();
                Ok(true)
            }
            TaskState::Done => Ok(false),
            _ => {
                task.unpark_permit.store(true, Ordering::Release);
                Ok(false)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let queue = self.shared.queue.lock();
        PoolStats {
            carriers: self.carrier_count,
            runnable: queue.runnable.len(),
            pending_timers: queue.timers.len(),
            live_tasks: self.shared.tasks.len(),
            completed_tasks: self.shared.completed.load(Ordering::Relaxed),
            quota_delays: self.shared.quota_delays.load(Ordering::Relaxed),
        }
    }

    /// Stop the carriers and cancel every task that has not finished
    ///
    /// Slices already running complete first. Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.wakeup.notify_all();

        let carriers: Vec<_> = self.carriers.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in carriers {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }

        let cancelled = {
            let mut queue = self.shared.queue.lock();
            queue.runnable.clear();
            queue.timers.drain();
            let mut cancelled = 0;
            for entry in self.shared.tasks.iter() {
                if entry.value().complete(TaskOutcome::Cancelled) {
                    cancelled += 1;
                }
            }
            self.shared.tasks.clear();
            cancelled
        };
        self.shared.ctx.logger().log_pool_shutdown(cancelled);
    }
}

impl Drop for CarrierPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CarrierPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarrierPool")
            .field("context_id", &self.shared.ctx.id())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolShared {
    fn carrier_main(self: Arc<Self>) {
        let guard = self.ctx.register_carrier();
        let carrier = guard.slot().clone();
        let logger = self.ctx.logger().clone();
        logger.log_carrier_started(carrier.id().as_u64(), carrier.name());

        let mut slices = 0u64;
        while let Some(task) = self.next_task() {
            self.dispatch(&carrier, &task);
            slices += 1;
        }

        logger.log_carrier_stopped(carrier.id().as_u64(), slices);
        drop(guard);
    }

    /// Block until a task is runnable; `None` once the pool shuts down
    fn next_task(&self) -> Option<Arc<Task>> {
        let clock = self.ctx.clock().clone();
        let mut queue = self.queue.lock();
        loop {
            if queue.shutdown {
                return None;
            }

            let now = clock.now_ns();
            for entry in queue.timers.pop_expired(now) {
                let task = entry.task;
                task.timer.lock().take();
                if entry.action == TimerAction::ParkTimeout {
                    task.timed_out.store(true, Ordering::Release);
                }
                task.set_state(TaskState::Runnable);
                queue.runnable.push_back(task);
            }

            if let Some(task) = queue.runnable.pop_front() {
                task.set_state(TaskState::Running);
                return Some(task);
            }

            match queue.timers.next_deadline() {
                Some(deadline) => {
                    let wait = (deadline - now).max(0) as u64;
                    self.wakeup.wait_for(&mut queue, Duration::from_nanos(wait));
                }
                None => self.wakeup.wait(&mut queue),
            }
        }
    }

    /// Run one slice of `task` on `carrier`
    fn dispatch(&self, carrier: &Arc<CarrierSlot>, task: &Arc<Task>) {
        let clock = self.ctx.clock();
        let container = &task.container;

        task.account.fold_unattributed(clock.now_ns());
        let group = container.cpu_group();

        if let Some(group) = &group {
            let delay = group.check_and_maybe_delay(&task.account, false);
            if delay > 0 {
                self.quota_delays.fetch_add(1, Ordering::Relaxed);
                self.ctx.metrics().inc_quota_rejections();
                self.ctx.metrics().observe_quota_delay(delay);
                self.ctx
                    .logger()
                    .log_quota_limit_reached(container.id(), task.id, delay);

                let mut queue = self.queue.lock();
                self.schedule(&mut queue, task, clock.now_ns() + delay, TimerAction::Wake);
                task.set_state(TaskState::Sleeping);
                return;
            }
            task.account.bind(group);
        } else {
            task.account.stamp(clock.now_ns());
        }

        carrier.set_current_task(Some((task.id, task.account.clone())));
        let timed_out = task.timed_out.swap(false, Ordering::AcqRel);

        let result = {
            let mut body = task.body.lock();
            container.run_admitted(carrier, || {
                let mut cx = TaskContext {
                    task_id: task.id,
                    carrier,
                    ctx: &self.ctx,
                    timed_out,
                };
                panic::catch_unwind(AssertUnwindSafe(|| body.resume(&mut cx)))
            })
        };

        match &group {
            Some(group) => {
                // A mid-slice root call re-binds through the container's current group
                let bound = task.account.group().unwrap_or_else(|| group.clone());
                let usage = bound.account_usage(&task.account);
                task.account.unbind();
                self.ctx.metrics().observe_slice_usage(usage);
            }
            None => {
                task.account.fold_unattributed(clock.now_ns());
            }
        }
        carrier.set_current_task(None);

        match result {
            Ok(Ok(step)) => self.after_step(task, step),
            Ok(Err(payload)) => self.finish(task, TaskOutcome::Failed(panic_message(&*payload))),
            Err(err) => self.finish(task, TaskOutcome::Failed(err.to_string())),
        }
    }

    fn after_step(&self, task: &Arc<Task>, step: Step) {
        let now = self.ctx.clock().now_ns();
        let mut queue = self.queue.lock();
        match step {
            Step::Yield => {
                task.set_state(TaskState::Runnable);
                queue.runnable.push_back(task.clone());
                drop(queue);
                self.wakeup.notify_one();
            }
            Step::Sleep(ns) => {
                self.schedule(&mut queue, task, now.saturating_add(ns.max(0)), TimerAction::Wake);
                task.set_state(TaskState::Sleeping);
            }
            Step::Park { deadline_ns } => {
                if task.unpark_permit.swap(false, Ordering::AcqRel) {
                    task.set_state(TaskState::Runnable);
                    queue.runnable.push_back(task.clone());
                    drop(queue);
                    self.wakeup.notify_one();
                    return;
                }
                if let Some(deadline) = deadline_ns {
                    self.schedule(&mut queue, task, deadline, TimerAction::ParkTimeout);
                }
                task.set_state(TaskState::Parked);
            }
            Step::Done => {
                drop(queue);
                self.finish(task, TaskOutcome::Completed);
            }
        }
    }

    fn schedule(&self, queue: &mut RunQueue, task: &Arc<Task>, deadline_ns: i64, action: TimerAction) {
        let id = queue.timers.insert(task.clone(), deadline_ns, action);
        *task.timer.lock() = Some(id);
        // Let an idle carrier shorten its wait if this deadline is the earliest
        self.wakeup.notify_one();
    }

    fn finish(&self, task: &Arc<Task>, outcome: TaskOutcome) {
        if let TaskOutcome::Failed(reason) = &outcome {
            self.ctx
                .logger()
                .log_task_failed(task.id, task.container.id(), reason);
        }
        self.tasks.remove(&task.id);
        if task.complete(outcome) {
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.ctx.metrics().inc_tasks_completed();
            debug!(task_id = task.id, "Task finished");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
