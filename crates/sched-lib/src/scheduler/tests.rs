//! Carrier pool tests
//!
//! These run with real carrier threads. Most use the monotonic clock; the
//! accounting tests drive a manual clock from inside the task body.

use super::{CarrierPool, Step, TaskContext, TaskOutcome};
use crate::clock::{ms, ManualClock};
use crate::config::SchedulerConfig;
use crate::container::{ContainerConfig, SchedulerContext};
use crate::error::SchedulerError;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const JOIN: Duration = Duration::from_secs(10);

fn pool(carriers: usize) -> CarrierPool {
    let ctx = SchedulerContext::new(SchedulerConfig::with_carriers(carriers));
    CarrierPool::start(ctx).unwrap()
}

const T0: i64 = 1_000_000_000;

fn manual_pool() -> (Arc<ManualClock>, CarrierPool) {
    let clock = Arc::new(ManualClock::new(T0));
    let config = SchedulerConfig {
        cpu_cores: 2,
        ..SchedulerConfig::with_carriers(1)
    };
    let ctx = SchedulerContext::with_clock(config, clock.clone());
    (clock, CarrierPool::start(ctx).unwrap())
}

fn spin(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + JOIN;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_task_runs_to_completion() {
    let pool = pool(2);
    let root = pool.context().root().clone();
    let resumes = Arc::new(AtomicU64::new(0));

    let counter = resumes.clone();
    let handle = pool
        .spawn(&root, move |_cx: &mut TaskContext<'_>| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Step::Yield
            } else {
                Step::Done
            }
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert_eq!(resumes.load(Ordering::SeqCst), 3);
    assert!(handle.is_finished());
    assert_eq!(pool.stats().live_tasks, 0);
}

#[test]
fn test_slice_runs_inside_task_container() {
    let pool = pool(1);
    let ctx = pool.context().clone();
    let container = ctx.create_container(ContainerConfig::new("tenant")).unwrap();
    let expected = container.id();
    let seen = Arc::new(AtomicBool::new(false));

    let flag = seen.clone();
    let handle = pool
        .spawn(&container, move |cx: &mut TaskContext<'_>| {
            assert_eq!(cx.container_id(), expected);
            assert_eq!(cx.carrier().current_task_id(), cx.task_id());
            assert_eq!(cx.context().current_container().id(), expected);
            flag.store(true, Ordering::SeqCst);
            Step::Done
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert!(seen.load(Ordering::SeqCst));
    assert!(container.active_carrier_ids().is_empty());
}

#[test]
fn test_sleep_resumes_after_delay() {
    let pool = pool(1);
    let root = pool.context().root().clone();
    let first = Arc::new(AtomicI64::new(0));

    let started = first.clone();
    let handle = pool
        .spawn(&root, move |cx: &mut TaskContext<'_>| {
            if started.load(Ordering::SeqCst) == 0 {
                started.store(cx.now_ns(), Ordering::SeqCst);
                return Step::sleep(Duration::from_millis(20));
            }
            assert!(cx.now_ns() - started.load(Ordering::SeqCst) >= 20_000_000);
            Step::Done
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
}

#[test]
fn test_unpark_cancels_park_timeout() {
    let pool = pool(1);
    let root = pool.context().root().clone();
    let timed_out = Arc::new(AtomicBool::new(true));
    let parked = Arc::new(AtomicBool::new(false));

    let (seen, has_parked) = (timed_out.clone(), parked.clone());
    let handle = pool
        .spawn(&root, move |cx: &mut TaskContext<'_>| {
            if !has_parked.swap(true, Ordering::SeqCst) {
                return Step::Park {
                    deadline_ns: Some(cx.now_ns() + 60_000_000_000),
                };
            }
            seen.store(cx.timed_out(), Ordering::SeqCst);
            Step::Done
        })
        .unwrap();

    wait_until(|| parked.load(Ordering::SeqCst) && pool.stats().pending_timers == 1);
    assert!(pool.unpark(handle.id()).unwrap());
    assert_eq!(pool.stats().pending_timers, 0);

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert!(!timed_out.load(Ordering::SeqCst));
}

#[test]
fn test_park_deadline_sets_timed_out() {
    let pool = pool(1);
    let root = pool.context().root().clone();
    let timed_out = Arc::new(AtomicBool::new(false));
    let mut parked = false;

    let seen = timed_out.clone();
    let handle = pool
        .spawn(&root, move |cx: &mut TaskContext<'_>| {
            if !parked {
                parked = true;
                return Step::Park {
                    deadline_ns: Some(cx.now_ns() + 10_000_000),
                };
            }
            seen.store(cx.timed_out(), Ordering::SeqCst);
            Step::Done
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert!(timed_out.load(Ordering::SeqCst));
}

#[test]
fn test_unpark_before_park_is_kept() {
    let pool = pool(1);
    let root = pool.context().root().clone();
    let ready = Arc::new(AtomicBool::new(false));
    let go = Arc::new(AtomicBool::new(false));
    let mut parked = false;

    let (running, release) = (ready.clone(), go.clone());
    let handle = pool
        .spawn(&root, move |_cx: &mut TaskContext<'_>| {
            if parked {
                return Step::Done;
            }
            running.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            parked = true;
            Step::park()
        })
        .unwrap();

    wait_until(|| ready.load(Ordering::SeqCst));
    // The task is mid-slice, so the wake-up becomes a permit
    assert!(!pool.unpark(handle.id()).unwrap());
    go.store(true, Ordering::SeqCst);

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
}

#[test]
fn test_unpark_unknown_task() {
    let pool = pool(1);
    assert_eq!(pool.unpark(9_999), Err(SchedulerError::UnknownTask(9_999)));
}

#[test]
fn test_panicking_task_fails_and_carrier_survives() {
    let pool = pool(1);
    let root = pool.context().root().clone();

    let failing = pool
        .spawn(&root, |_cx: &mut TaskContext<'_>| -> Step { panic!("boom") })
        .unwrap();
    match failing.join(JOIN).unwrap() {
        TaskOutcome::Failed(reason) => assert!(reason.contains("boom")),
        other => panic!("unexpected outcome {other:?}"),
    }

    let next = pool.spawn(&root, |_cx: &mut TaskContext<'_>| Step::Done).unwrap();
    assert_eq!(next.join(JOIN).unwrap(), TaskOutcome::Completed);
}

#[test]
fn test_task_in_destroyed_container_fails() {
    let pool = pool(1);
    let container = pool
        .context()
        .create_container(ContainerConfig::new("gone").cpu_percent(50))
        .unwrap();
    container.destroy().unwrap();

    let handle = pool
        .spawn(&container, |_cx: &mut TaskContext<'_>| Step::Done)
        .unwrap();
    match handle.join(JOIN).unwrap() {
        TaskOutcome::Failed(reason) => assert!(reason.contains("destroyed")),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_throttled_task_waits_on_timer() {
    let pool = pool(1);
    let container = pool
        .context()
        .create_container(ContainerConfig::new("throttled").cpu_percent(10))
        .unwrap();
    let group = container.cpu_group().unwrap();
    let mut slices = 0;

    let handle = pool
        .spawn(&container, move |_cx: &mut TaskContext<'_>| {
            spin(Duration::from_millis(4));
            slices += 1;
            if slices < 8 {
                Step::Yield
            } else {
                Step::Done
            }
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert!(pool.stats().quota_delays > 0);
    assert!(group.limit_reached_count() > 0);
    assert!(group.consumed_ns() >= 32_000_000);
}

#[test]
fn test_throttled_container_does_not_block_others() {
    let pool = pool(1);
    let ctx = pool.context().clone();
    let slow = ctx
        .create_container(ContainerConfig::new("slow").cpu_percent(1))
        .unwrap();
    let fast = ctx.create_container(ContainerConfig::new("fast")).unwrap();

    let throttled = pool
        .spawn(&slow, |_cx: &mut TaskContext<'_>| {
            spin(Duration::from_millis(20));
            Step::Yield
        })
        .unwrap();
    wait_until(|| slow.cpu_group().is_some_and(|g| g.limit_reached_count() > 0));

    let free = pool
        .spawn(&fast, |_cx: &mut TaskContext<'_>| Step::Done)
        .unwrap();
    assert_eq!(free.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert!(!throttled.is_finished());
}

#[test]
fn test_unlimited_task_accumulates_total_time() {
    let pool = pool(1);
    let root = pool.context().root().clone();

    let handle = pool
        .spawn(&root, |_cx: &mut TaskContext<'_>| {
            spin(Duration::from_millis(5));
            Step::Done
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert!(handle.total_ts() >= 5_000_000);
}

#[test]
fn test_shutdown_cancels_pending_tasks() {
    let pool = pool(2);
    let root = pool.context().root().clone();

    let parked = pool
        .spawn(&root, |_cx: &mut TaskContext<'_>| Step::park())
        .unwrap();
    wait_until(|| pool.stats().runnable == 0 && pool.stats().live_tasks == 1);

    pool.shutdown();
    assert_eq!(parked.join(JOIN).unwrap(), TaskOutcome::Cancelled);
    assert_eq!(
        pool.spawn(&root, |_cx: &mut TaskContext<'_>| Step::Done).unwrap_err(),
        SchedulerError::ShutDown
    );

    // Idempotent
    pool.shutdown();
}

#[test]
fn test_join_times_out() {
    let pool = pool(1);
    let root = pool.context().root().clone();
    let handle = pool
        .spawn(&root, |_cx: &mut TaskContext<'_>| Step::park())
        .unwrap();

    assert_eq!(
        handle.join(Duration::from_millis(10)),
        Err(SchedulerError::JoinTimeout(handle.id()))
    );
}

#[test]
fn test_root_call_keeps_unlimited_slice_folding() {
    let (clock, pool) = manual_pool();
    let tenant = pool
        .context()
        .create_container(ContainerConfig::new("tenant"))
        .unwrap();
    let expected = tenant.id();

    let tick = clock.clone();
    let handle = pool
        .spawn(&tenant, move |cx: &mut TaskContext<'_>| {
            tick.advance(ms(10));
            cx.context().root().run(|| tick.advance(ms(5))).unwrap();
            assert_eq!(cx.context().current_container().id(), expected);
            tick.advance(ms(20));
            Step::Done
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert_eq!(handle.total_ts(), ms(35));
}

#[test]
fn test_container_call_from_root_task_charges_only_inner_part() {
    let (clock, pool) = manual_pool();
    let ctx = pool.context().clone();
    let limited = ctx
        .create_container(ContainerConfig::new("limited").cpu_percent(40))
        .unwrap();
    let group = limited.cpu_group().unwrap();
    let root = ctx.root().clone();

    let (tick, inner) = (clock.clone(), limited.clone());
    let handle = pool
        .spawn(&root, move |_cx: &mut TaskContext<'_>| {
            tick.advance(ms(10));
            inner.run(|| tick.advance(ms(5))).unwrap();
            tick.advance(ms(20));
            Step::Done
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    assert_eq!(handle.total_ts(), ms(30));
    assert_eq!(group.consumed_ns(), ms(5));
}

#[test]
fn test_root_call_in_limited_slice_is_not_charged() {
    let (clock, pool) = manual_pool();
    let limited = pool
        .context()
        .create_container(ContainerConfig::new("limited").cpu_percent(40))
        .unwrap();
    let group = limited.cpu_group().unwrap();

    let tick = clock.clone();
    let handle = pool
        .spawn(&limited, move |cx: &mut TaskContext<'_>| {
            tick.advance(ms(10));
            cx.context().root().run(|| tick.advance(ms(5))).unwrap();
            tick.advance(ms(20));
            Step::Done
        })
        .unwrap();

    assert_eq!(handle.join(JOIN).unwrap(), TaskOutcome::Completed);
    // First and last parts are charged once, the root part is folded
    assert_eq!(group.consumed_ns(), ms(30));
    assert_eq!(group.limit_reached_count(), 0);
    assert_eq!(handle.total_ts(), ms(5));
    assert!(limited.active_carrier_ids().is_empty());
}
