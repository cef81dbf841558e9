//! Integration tests for the three scheduling policies and the scheduler
//! listener protocol.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use common::{init_logging, settle, OpTrace};
use opvisor::{
    CancellingScheduler, FnOp, NoWaitScheduler, OpError, OpListener, OpRef, OpScheduler, OpState,
    QueuedScheduler, SchedulerWatcher,
};

/// An operation that completes with `value` once `gate` is released, or
/// cancels cooperatively.
fn gated(name: &'static str, gate: Arc<Notify>, value: u32) -> opvisor::AsyncOp<u32> {
    FnOp::new(name, move |ctx| async move {
        tokio::select! {
            _ = gate.notified() => Ok(value),
            _ = ctx.cancelled() => Err(OpError::Stopped),
        }
    })
}

struct SubmitLog {
    names: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SchedulerWatcher for SubmitLog {
    async fn on_submitted(&self, op: &OpRef) {
        self.names.lock().unwrap().push(op.name().to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn policy_ids_are_stable() {
    assert_eq!(NoWaitScheduler::new().policy_id(), "nowait");
    assert_eq!(QueuedScheduler::new().policy_id(), "queued");
    assert_eq!(CancellingScheduler::new().policy_id(), "cancel_previous");
}

#[tokio::test(start_paused = true)]
async fn nowait_is_transparent() {
    init_logging();

    // Direct start.
    let direct = FnOp::new("direct", |_ctx| async move { Ok::<_, OpError>(1u32) });
    let direct_trace = OpTrace::new();
    direct.add_listener(OpListener::Sink(Arc::new(direct_trace.clone())));
    direct.start().await.unwrap();
    direct.wait_for_finished().await;

    // Through the no-wait scheduler.
    let scheduled = FnOp::new("scheduled", |_ctx| async move { Ok::<_, OpError>(1u32) });
    let scheduled_trace = OpTrace::new();
    scheduled.add_listener(OpListener::Sink(Arc::new(scheduled_trace.clone())));
    scheduled.set_scheduler(NoWaitScheduler::new());
    scheduled.start().await.unwrap();
    scheduled.wait_for_finished().await;

    settle().await;
    // Identical observable traces and outcomes.
    assert_eq!(direct_trace.snapshot(), scheduled_trace.snapshot());
    assert_eq!(scheduled_trace.snapshot(), vec![OpState::Running, OpState::Completed]);
    assert_eq!(scheduled.result().unwrap(), direct.result().unwrap());
}

#[tokio::test(start_paused = true)]
async fn queued_runs_one_at_a_time_in_fifo_order() {
    init_logging();
    let scheduler = QueuedScheduler::new();

    let first_gate = Arc::new(Notify::new());
    let first = gated("first", Arc::clone(&first_gate), 1);
    first.set_scheduler(scheduler.clone());

    let second_gate = Arc::new(Notify::new());
    let second = gated("second", Arc::clone(&second_gate), 2);
    second.set_scheduler(scheduler.clone());

    first.start().await.unwrap();
    first.wait_for_started().await;

    second.start().await.unwrap();
    settle().await;
    // Queued behind the running one: still not started.
    assert_eq!(second.state(), OpState::NotStarted);

    first_gate.notify_one();
    first.wait_for_finished().await;
    assert_eq!(first.result().unwrap(), 1);

    // The scheduler hands the slot to the queued entry.
    second.wait_for_started().await;
    second_gate.notify_one();
    second.wait_for_finished().await;
    assert_eq!(second.result().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn queued_stop_all_drains_running_and_queued() {
    init_logging();
    let scheduler = QueuedScheduler::new();

    let running = gated("running", Arc::new(Notify::new()), 1);
    running.set_scheduler(scheduler.clone());
    running.start().await.unwrap();
    running.wait_for_started().await;

    let waiting = gated("waiting", Arc::new(Notify::new()), 2);
    waiting.set_scheduler(scheduler.clone());
    waiting.start().await.unwrap();

    scheduler.stop_all().await;

    assert_eq!(running.state(), OpState::Cancelled);
    assert_eq!(waiting.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancel_previous_replaces_the_running_operation() {
    init_logging();
    let scheduler = CancellingScheduler::new();

    let first = gated("first", Arc::new(Notify::new()), 1);
    first.set_scheduler(scheduler.clone());
    first.start().await.unwrap();
    first.wait_for_started().await;

    let second_gate = Arc::new(Notify::new());
    let second = gated("second", Arc::clone(&second_gate), 2);
    second.set_scheduler(scheduler.clone());
    second.start().await.unwrap();

    // The submission waited for the previous operation to finish.
    assert_eq!(first.state(), OpState::Cancelled);

    second.wait_for_started().await;
    second_gate.notify_one();
    second.wait_for_finished().await;
    assert_eq!(second.result().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_previous_stop_all_cancels_the_running_operation() {
    init_logging();
    let scheduler = CancellingScheduler::new();

    let op = gated("victim", Arc::new(Notify::new()), 1);
    op.set_scheduler(scheduler.clone());
    op.start().await.unwrap();
    op.wait_for_started().await;

    scheduler.stop_all().await;
    assert_eq!(op.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn scheduler_listeners_observe_submissions_only() {
    init_logging();
    let scheduler = NoWaitScheduler::new();
    let names = Arc::new(Mutex::new(Vec::new()));
    scheduler.add_listener(Arc::new(SubmitLog {
        names: Arc::clone(&names),
    }));

    let op = FnOp::new("tracked", |_ctx| async move { Ok::<_, OpError>(()) });
    op.set_scheduler(scheduler.clone());
    op.start().await.unwrap();
    op.wait_for_finished().await;
    settle().await;

    assert_eq!(*names.lock().unwrap(), vec!["tracked".to_string()]);
}
