//! Integration tests for the operation combinators and the
//! future-condition helpers.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use common::{init_logging, settle, OpTrace};
use opvisor::{
    AsyncOp, BackgroundedOp, ConcurrentOp, DelayedOp, FnOp, IdleOp, NopOp, OnFaultOp, OpCondition,
    OpError, OpListener, OpState, PeriodicOp, SequentialOp, Service, ServiceCondition,
    ServiceError, TimedOp, ThreadedService, ServiceContext,
};

/// A cancellable operation that completes with `value` after `duration`.
fn sleeper(name: &'static str, duration: Duration, value: u32) -> AsyncOp<u32> {
    FnOp::new(name, move |ctx| async move {
        tokio::select! {
            _ = sleep(duration) => Ok(value),
            _ = ctx.cancelled() => Err(OpError::Stopped),
        }
    })
}

#[tokio::test(start_paused = true)]
async fn nop_completes_immediately() {
    init_logging();
    let op = NopOp::new();
    let trace = OpTrace::new();
    op.add_listener(OpListener::Sink(Arc::new(trace.clone())));

    op.start().await.unwrap();
    op.wait_for_finished().await;
    assert_eq!(op.state(), OpState::Completed);

    settle().await;
    assert_eq!(trace.snapshot(), vec![OpState::Running, OpState::Completed]);
}

#[tokio::test(start_paused = true)]
async fn idle_sleeps_then_completes() {
    init_logging();
    let op = IdleOp::new(Duration::from_millis(100));
    let t0 = Instant::now();
    op.start().await.unwrap();
    op.wait_for_finished().await;

    assert!(t0.elapsed() >= Duration::from_millis(100));
    assert_eq!(op.state(), OpState::Completed);
}

#[tokio::test(start_paused = true)]
async fn idle_is_cancellable() {
    init_logging();
    let op = IdleOp::new(Duration::from_secs(3600));
    op.start().await.unwrap();
    op.wait_for_started().await;

    op.cancel().await;
    op.wait_for_finished().await;
    assert_eq!(op.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn sequential_adopts_the_last_result() {
    init_logging();
    let a = FnOp::new("a", |_ctx| async move { Ok::<_, OpError>("a".to_string()) });
    let b = FnOp::new("b", |_ctx| async move { Ok::<_, OpError>("b".to_string()) });
    let seq = SequentialOp::new(vec![a.clone(), b.clone()]).unwrap();

    seq.start().await.unwrap();
    seq.wait_for_finished().await;

    assert_eq!(seq.state(), OpState::Completed);
    assert_eq!(seq.result().unwrap(), "b");
    assert_eq!(a.result().unwrap(), "a");
}

#[tokio::test(start_paused = true)]
async fn sequential_short_circuits_on_failure() {
    init_logging();
    let ok = FnOp::new("ok", |_ctx| async move { Ok::<_, OpError>(1u32) });
    let bad = FnOp::new("bad", |_ctx| async move {
        Err::<u32, _>(OpError::failed("boom"))
    });
    let never = sleeper("never", Duration::from_secs(3600), 3);
    let seq = SequentialOp::new(vec![ok, bad, never.clone()]).unwrap();

    seq.start().await.unwrap();
    seq.wait_for_finished().await;

    assert_eq!(seq.state(), OpState::Failed);
    assert_eq!(seq.failure_cause(), Some(OpError::failed("boom")));
    // The third element never started.
    assert_eq!(never.state(), OpState::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn sequential_cancel_cancels_the_current_element() {
    init_logging();
    let long = sleeper("long", Duration::from_secs(3600), 1);
    let tail = FnOp::new("tail", |_ctx| async move { Ok::<_, OpError>(2u32) });
    let seq = SequentialOp::new(vec![long.clone(), tail.clone()]).unwrap();

    seq.start().await.unwrap();
    seq.wait_for_started().await;

    seq.cancel().await;
    seq.wait_for_finished().await;

    assert_eq!(seq.state(), OpState::Cancelled);
    assert_eq!(long.state(), OpState::Cancelled);
    assert_eq!(tail.state(), OpState::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn concurrent_completes_when_all_finish() {
    init_logging();
    let fast = sleeper("fast", Duration::from_millis(10), 1);
    let slow = sleeper("slow", Duration::from_millis(80), 2);
    let parent =
        ConcurrentOp::new(vec![fast.clone().erased(), slow.clone().erased()]).unwrap();

    parent.start().await.unwrap();
    parent.wait_for_finished().await;

    assert_eq!(parent.state(), OpState::Completed);
    assert_eq!(fast.result().unwrap(), 1);
    assert_eq!(slow.result().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_quorum_cancels_the_rest() {
    init_logging();
    let fast = sleeper("fast", Duration::from_millis(10), 1);
    let slow = sleeper("slow", Duration::from_secs(3600), 2);
    let parent =
        ConcurrentOp::with_quorum(vec![fast.clone().erased(), slow.clone().erased()], 1).unwrap();

    parent.start().await.unwrap();
    parent.wait_for_finished().await;

    assert_eq!(parent.state(), OpState::Completed);
    assert_eq!(fast.state(), OpState::Completed);
    assert_eq!(slow.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn concurrent_cancel_reaches_every_element() {
    init_logging();
    let one = sleeper("one", Duration::from_secs(3600), 1);
    let two = sleeper("two", Duration::from_secs(3600), 2);
    let parent = ConcurrentOp::new(vec![one.clone().erased(), two.clone().erased()]).unwrap();

    parent.start().await.unwrap();
    parent.wait_for_started().await;

    parent.cancel().await;
    parent.wait_for_finished().await;

    assert_eq!(parent.state(), OpState::Cancelled);
    assert_eq!(one.state(), OpState::Cancelled);
    assert_eq!(two.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn timed_with_on_timeout_adopts_the_handler() {
    init_logging();
    let inner = IdleOp::new(Duration::from_millis(1000));
    let timed = TimedOp::with_on_timeout(inner.erased(), Duration::from_millis(200), || {
        NopOp::new().erased()
    })
    .unwrap();

    let t0 = Instant::now();
    timed.op().start().await.unwrap();
    timed.op().wait_for_finished().await;

    // The deadline fired at ~200 ms, well before the inner's 1 s.
    assert!(t0.elapsed() >= Duration::from_millis(200));
    assert!(t0.elapsed() < Duration::from_millis(1000));
    assert_eq!(inner.state(), OpState::Cancelled);
    assert_eq!(timed.op().state(), OpState::Completed);
    assert!(timed.is_timed_out());
}

#[tokio::test(start_paused = true)]
async fn timed_propagates_an_inner_finish() {
    init_logging();
    let inner = IdleOp::new(Duration::from_millis(50));
    let timed = TimedOp::new(inner.erased(), Duration::from_secs(10)).unwrap();

    timed.op().start().await.unwrap();
    timed.op().wait_for_finished().await;

    assert_eq!(timed.op().state(), OpState::Completed);
    assert!(!timed.is_timed_out());
}

#[tokio::test(start_paused = true)]
async fn timed_without_handler_completes_on_timeout() {
    init_logging();
    let inner = IdleOp::new(Duration::from_secs(3600));
    let timed = TimedOp::new(inner.erased(), Duration::from_millis(100)).unwrap();

    timed.op().start().await.unwrap();
    timed.op().wait_for_finished().await;

    assert_eq!(timed.op().state(), OpState::Completed);
    assert!(timed.is_timed_out());
    assert_eq!(inner.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn timed_propagates_an_inner_failure() {
    init_logging();
    let inner = FnOp::new("doomed", |_ctx| async move {
        sleep(Duration::from_millis(10)).await;
        Err::<(), _>(OpError::failed("inner broke"))
    });
    let timed = TimedOp::new(inner.erased(), Duration::from_secs(10)).unwrap();

    timed.op().start().await.unwrap();
    timed.op().wait_for_finished().await;

    assert_eq!(timed.op().state(), OpState::Failed);
    assert_eq!(
        timed.op().failure_cause(),
        Some(OpError::failed("inner broke"))
    );
}

#[tokio::test(start_paused = true)]
async fn delayed_starts_after_the_delay() {
    init_logging();
    let target = FnOp::new("target", |_ctx| async move { Ok::<_, OpError>(7u32) });
    let delayed = DelayedOp::new(target.clone(), Duration::from_millis(100));

    let t0 = Instant::now();
    delayed.start().await.unwrap();
    delayed.wait_for_finished().await;

    assert!(t0.elapsed() >= Duration::from_millis(100));
    assert_eq!(delayed.state(), OpState::Completed);
    assert_eq!(delayed.result().unwrap(), 7);
    assert_eq!(target.result().unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn delayed_cancel_before_the_tick_never_starts_the_target() {
    init_logging();
    let target = FnOp::new("target", |_ctx| async move { Ok::<_, OpError>(7u32) });
    let delayed = DelayedOp::new(target.clone(), Duration::from_secs(3600));

    delayed.start().await.unwrap();
    delayed.wait_for_started().await;
    sleep(Duration::from_millis(10)).await;

    delayed.cancel().await;
    delayed.wait_for_finished().await;

    assert_eq!(delayed.state(), OpState::Cancelled);
    assert_eq!(target.state(), OpState::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn periodic_completes_after_the_configured_rounds() {
    init_logging();
    let counter = Arc::new(AtomicU32::new(0));
    let factory = {
        let counter = Arc::clone(&counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            NopOp::new().erased()
        }
    };
    let periodic = PeriodicOp::new(
        factory,
        Duration::from_millis(20),
        Duration::from_millis(10),
        Some(3),
    )
    .unwrap();

    periodic.start().await.unwrap();
    periodic.wait_for_finished().await;

    assert_eq!(periodic.state(), OpState::Completed);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn periodic_forever_is_cancellable() {
    init_logging();
    let periodic = PeriodicOp::new(
        || IdleOp::new(Duration::from_millis(50)).erased(),
        Duration::ZERO,
        Duration::from_millis(50),
        None,
    )
    .unwrap();

    periodic.start().await.unwrap();
    sleep(Duration::from_millis(120)).await;

    periodic.cancel().await;
    periodic.wait_for_finished().await;
    assert_eq!(periodic.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn periodic_propagates_a_round_failure() {
    init_logging();
    let periodic = PeriodicOp::new(
        || {
            FnOp::new("round", |_ctx| async move {
                Err::<(), _>(OpError::failed("round broke"))
            })
            .erased()
        },
        Duration::ZERO,
        Duration::from_millis(10),
        None,
    )
    .unwrap();

    periodic.start().await.unwrap();
    periodic.wait_for_finished().await;

    assert_eq!(periodic.state(), OpState::Failed);
    assert_eq!(
        periodic.failure_cause(),
        Some(OpError::failed("round broke"))
    );
}

#[tokio::test(start_paused = true)]
async fn backgrounded_mirrors_the_foreground_and_cancels_the_background() {
    init_logging();
    let fg = FnOp::new("fg", |_ctx| async move {
        sleep(Duration::from_millis(30)).await;
        Ok::<_, OpError>("done".to_string())
    });
    let bg = sleeper("bg", Duration::from_secs(3600), 0);
    let parent = BackgroundedOp::new(fg.clone(), bg.clone().erased());

    parent.start().await.unwrap();
    parent.wait_for_finished().await;

    assert_eq!(parent.state(), OpState::Completed);
    assert_eq!(parent.result().unwrap(), "done");
    assert_eq!(bg.state(), OpState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn on_fault_adopts_the_handler_completion() {
    init_logging();
    let target = FnOp::new("target", |_ctx| async move {
        Err::<String, _>(OpError::failed("primary broke"))
    });
    let parent = OnFaultOp::new(target, |_cause| {
        FnOp::new("handler", |_ctx| async move {
            Ok::<_, OpError>("rescued".to_string())
        })
    });

    parent.start().await.unwrap();
    parent.wait_for_finished().await;

    assert_eq!(parent.state(), OpState::Completed);
    assert_eq!(parent.result().unwrap(), "rescued");
}

#[tokio::test(start_paused = true)]
async fn on_fault_restores_the_original_cause_when_the_handler_fails() {
    init_logging();
    let target = FnOp::new("target", |_ctx| async move {
        Err::<u32, _>(OpError::failed("original"))
    });
    let parent = OnFaultOp::new(target, |_cause| {
        FnOp::new("handler", |_ctx| async move {
            Err::<u32, _>(OpError::failed("handler also broke"))
        })
    });

    parent.start().await.unwrap();
    parent.wait_for_finished().await;

    assert_eq!(parent.state(), OpState::Failed);
    assert_eq!(parent.failure_cause(), Some(OpError::failed("original")));
}

#[tokio::test(start_paused = true)]
async fn on_fault_passes_a_completion_through() {
    init_logging();
    let target = FnOp::new("target", |_ctx| async move { Ok::<_, OpError>(11u32) });
    let parent = OnFaultOp::new(target, |_cause| {
        FnOp::new("handler", |_ctx| async move { Ok::<_, OpError>(0u32) })
    });

    parent.start().await.unwrap();
    parent.wait_for_finished().await;

    assert_eq!(parent.result().unwrap(), 11);
}

#[tokio::test(start_paused = true)]
async fn op_condition_becomes_done_once() {
    init_logging();
    let op = sleeper("watched", Duration::from_millis(50), 1);
    let mut condition = OpCondition::when_finished(&op);
    assert!(!condition.evaluate_now());

    op.start().await.unwrap();
    assert!(!condition.wait_for(Duration::from_millis(10)).await);

    condition.wait().await;
    assert!(condition.evaluate_now());
    assert_eq!(op.state(), OpState::Completed);
}

#[tokio::test(start_paused = true)]
async fn service_condition_observes_the_running_state() {
    init_logging();
    let svc = ThreadedService::from_fn("conditioned", |ctx: ServiceContext| async move {
        ctx.cancelled().await;
        Ok::<_, ServiceError>(())
    });
    let mut running = ServiceCondition::when_running(&svc);
    let mut finished = ServiceCondition::when_finished(&svc);
    assert!(!running.evaluate_now());
    // A never-started service is already finished (it is stopped).
    assert!(finished.evaluate_now());

    svc.start().await.unwrap();
    running.wait().await;
    assert!(running.evaluate_now());

    svc.stop().await;
    let mut stopped = ServiceCondition::when_stopped(&svc);
    assert!(stopped.evaluate_now());
}

#[tokio::test(start_paused = true)]
async fn conditions_work_for_plain_services_too() {
    init_logging();
    struct Noop;
    #[async_trait::async_trait]
    impl opvisor::ServiceBody for Noop {
        async fn start_service(&self, _service: &Service) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    let svc = Service::new("plain", Noop);
    let mut condition = ServiceCondition::when_running(&svc);

    let waiter = tokio::spawn(async move {
        condition.wait_for(Duration::from_secs(5)).await
    });
    sleep(Duration::from_millis(10)).await;
    svc.start().await.unwrap();
    assert!(waiter.await.unwrap());
}
