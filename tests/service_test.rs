//! Integration tests for the service state machine: lifecycle, failure
//! handling and recovery, the threaded service, and service combinators.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use common::{init_logging, settle, ServiceTrace};
use opvisor::{
    chain, failure_dependency, CompositeService, ConcurrentService, ConcurrentServiceBuilder,
    Service, ServiceBody, ServiceContext, ServiceError, ServiceListener, ServiceState,
    ThreadedService,
};

struct NoopBody;

#[async_trait]
impl ServiceBody for NoopBody {
    async fn start_service(&self, _service: &Service) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
        Ok(())
    }
}

struct FailingStart;

#[async_trait]
impl ServiceBody for FailingStart {
    async fn start_service(&self, _service: &Service) -> Result<(), ServiceError> {
        Err(ServiceError::failed("init exploded"))
    }

    async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Reports a runtime failure on its own ~100 ms after starting.
struct SelfFailing;

#[async_trait]
impl ServiceBody for SelfFailing {
    async fn start_service(&self, service: &Service) -> Result<(), ServiceError> {
        let svc = service.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            svc.notify_failed(ServiceError::failed("error")).await;
        });
        Ok(())
    }

    async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Declares every failure recovered in place.
struct Recovering {
    stop_ran: Arc<AtomicBool>,
}

#[async_trait]
impl ServiceBody for Recovering {
    async fn start_service(&self, _service: &Service) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
        self.stop_ran.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_failure(&self, _service: &Service, _cause: &ServiceError) -> ServiceState {
        ServiceState::Running
    }
}

#[tokio::test(start_paused = true)]
async fn basic_service_lifecycle() {
    init_logging();
    let svc = Service::new("basic", NoopBody);
    let trace = ServiceTrace::new();
    svc.add_listener(ServiceListener::Sink(Arc::new(trace.clone())));

    assert_eq!(svc.state(), ServiceState::Stopped);
    svc.start().await.unwrap();
    assert!(svc.is_running());

    svc.stop().await;
    assert!(svc.is_stopped());

    settle().await;
    assert_eq!(
        trace.snapshot(),
        vec![
            (ServiceState::Stopped, ServiceState::Running),
            (ServiceState::Running, ServiceState::Stopped),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn start_while_running_is_illegal() {
    init_logging();
    let svc = Service::new("basic", NoopBody);
    svc.start().await.unwrap();
    let err = svc.start().await.unwrap_err();
    assert!(matches!(err, ServiceError::IllegalState(_)));
}

#[tokio::test(start_paused = true)]
async fn service_is_restartable() {
    init_logging();
    let svc = Service::new("basic", NoopBody);
    svc.start().await.unwrap();
    svc.stop().await;
    svc.start().await.unwrap();
    assert!(svc.is_running());
}

#[tokio::test(start_paused = true)]
async fn failing_start_hook_surfaces_and_records_cause() {
    init_logging();
    let svc = Service::new("broken", FailingStart);
    let trace = ServiceTrace::new();
    svc.add_listener(ServiceListener::Sink(Arc::new(trace.clone())));

    let err = svc.start().await.unwrap_err();
    assert_eq!(err, ServiceError::failed("init exploded"));
    assert!(svc.is_failed());
    assert_eq!(svc.failure_cause(), Some(ServiceError::failed("init exploded")));

    settle().await;
    assert_eq!(
        trace.snapshot(),
        vec![(ServiceState::Stopped, ServiceState::Failed)]
    );

    // A failed service may be restarted (the hook fails again here).
    assert!(svc.start().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn notify_failed_default_handler_declares_failed() {
    init_logging();
    let stop_ran = Arc::new(AtomicBool::new(false));
    struct Plain {
        stop_ran: Arc<AtomicBool>,
    }
    #[async_trait]
    impl ServiceBody for Plain {
        async fn start_service(&self, _service: &Service) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn stop_service(&self, _service: &Service) -> Result<(), ServiceError> {
            self.stop_ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let svc = Service::new(
        "plain",
        Plain {
            stop_ran: Arc::clone(&stop_ran),
        },
    );
    let trace = ServiceTrace::new();
    svc.add_listener(ServiceListener::Sink(Arc::new(trace.clone())));

    svc.start().await.unwrap();
    svc.notify_failed(ServiceError::failed("boom")).await;

    assert!(svc.is_failed());
    assert_eq!(svc.failure_cause(), Some(ServiceError::failed("boom")));
    // The default failure handler stopped the body quietly.
    assert!(stop_ran.load(Ordering::SeqCst));

    settle().await;
    assert_eq!(
        trace.snapshot(),
        vec![
            (ServiceState::Stopped, ServiceState::Running),
            (ServiceState::Running, ServiceState::Failed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failure_handler_can_recover_silently() {
    init_logging();
    let stop_ran = Arc::new(AtomicBool::new(false));
    let svc = Service::new(
        "recovering",
        Recovering {
            stop_ran: Arc::clone(&stop_ran),
        },
    );
    let trace = ServiceTrace::new();
    svc.add_listener(ServiceListener::Sink(Arc::new(trace.clone())));

    svc.start().await.unwrap();
    svc.notify_failed(ServiceError::failed("transient glitch")).await;

    // Recovered in place: still running, no failure cause, no extra event.
    assert!(svc.is_running());
    assert_eq!(svc.failure_cause(), None);
    assert!(!stop_ran.load(Ordering::SeqCst));

    settle().await;
    assert_eq!(
        trace.snapshot(),
        vec![(ServiceState::Stopped, ServiceState::Running)]
    );
}

#[tokio::test(start_paused = true)]
async fn notify_interrupted_stops_a_running_service() {
    init_logging();
    let svc = Service::new("basic", NoopBody);
    let trace = ServiceTrace::new();
    svc.add_listener(ServiceListener::Sink(Arc::new(trace.clone())));

    svc.start().await.unwrap();
    svc.notify_interrupted().await;
    assert!(svc.is_stopped());

    // Ignored outside Running.
    svc.notify_interrupted().await;
    assert!(svc.is_stopped());

    settle().await;
    assert_eq!(
        trace.snapshot(),
        vec![
            (ServiceState::Stopped, ServiceState::Running),
            (ServiceState::Running, ServiceState::Stopped),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn wait_for_finished_observes_the_deadline() {
    init_logging();
    let svc = Service::new("basic", NoopBody);
    svc.start().await.unwrap();

    assert!(!svc.wait_for_finished_for(Duration::from_millis(50)).await);

    let waiter = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.wait_for_finished_for(Duration::from_secs(5)).await })
    };
    sleep(Duration::from_millis(10)).await;
    svc.stop().await;
    assert!(waiter.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn threaded_service_with_manual_start_notification() {
    init_logging();
    let svc = ThreadedService::with_manual_start("warmup", |ctx: ServiceContext| async move {
        sleep(Duration::from_millis(200)).await;
        ctx.notify_started();
        sleep(Duration::from_millis(300)).await;
        Ok::<_, ServiceError>(())
    });

    let t0 = Instant::now();
    svc.start().await.unwrap();
    assert!(t0.elapsed() >= Duration::from_millis(200));
    assert!(svc.is_running());

    svc.wait_for_finished().await;
    assert!(t0.elapsed() >= Duration::from_millis(500));
    assert!(svc.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn threaded_service_stops_cooperatively() {
    init_logging();
    let svc = ThreadedService::from_fn("looper", |ctx: ServiceContext| async move {
        ctx.cancelled().await;
        Ok::<_, ServiceError>(())
    });

    svc.start().await.unwrap();
    assert!(svc.is_running());

    svc.stop().await;
    assert!(svc.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn threaded_service_failure_before_start_signal_surfaces() {
    init_logging();
    let svc = ThreadedService::with_manual_start("doomed", |_ctx: ServiceContext| async move {
        sleep(Duration::from_millis(50)).await;
        Err::<(), _>(ServiceError::failed("prelude broke"))
    });

    let err = svc.start().await.unwrap_err();
    assert_eq!(err, ServiceError::failed("prelude broke"));
    assert!(svc.is_failed());
}

#[tokio::test(start_paused = true)]
async fn threaded_service_failure_after_start_routes_through_notify_failed() {
    init_logging();
    let svc = ThreadedService::from_fn("flaky", |_ctx: ServiceContext| async move {
        sleep(Duration::from_millis(50)).await;
        Err::<(), _>(ServiceError::failed("runtime woe"))
    });

    svc.start().await.unwrap();
    assert!(svc.is_running());

    svc.wait_for_finished().await;
    assert!(svc.is_failed());
    assert_eq!(svc.failure_cause(), Some(ServiceError::failed("runtime woe")));
}

#[tokio::test(start_paused = true)]
async fn composite_start_failure_rolls_back() {
    init_logging();
    let healthy = Service::new("healthy", NoopBody);
    let doomed = Service::new("doomed", FailingStart);
    let parent = CompositeService::new(vec![healthy.clone(), doomed.clone()]).unwrap();

    let err = parent.start().await.unwrap_err();
    assert_eq!(err, ServiceError::failed("init exploded"));

    assert!(parent.is_failed());
    assert!(healthy.is_stopped());
    assert!(doomed.is_failed());
}

#[tokio::test(start_paused = true)]
async fn composite_propagates_member_failure() {
    init_logging();
    let steady = Service::new("steady", NoopBody);
    let flaky = Service::new("flaky", SelfFailing);
    let parent = CompositeService::new(vec![steady.clone(), flaky.clone()]).unwrap();

    parent.start().await.unwrap();
    assert!(parent.is_running());

    sleep(Duration::from_millis(150)).await;
    settle().await;

    assert!(flaky.is_failed());
    assert!(parent.is_failed());
    assert_eq!(parent.failure_cause(), Some(ServiceError::failed("error")));
    // The default handler stopped the healthy member.
    assert!(steady.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn composite_stops_when_a_member_stops_unsolicited() {
    init_logging();
    let first = Service::new("first", NoopBody);
    let second = Service::new("second", NoopBody);
    let parent = CompositeService::new(vec![first.clone(), second.clone()]).unwrap();

    parent.start().await.unwrap();
    first.notify_interrupted().await;
    settle().await;

    assert!(parent.is_stopped());
    assert!(second.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn concurrent_service_tolerates_member_failure() {
    init_logging();
    let steady = Service::new("steady", NoopBody);
    let flaky = Service::new("flaky", SelfFailing);
    let parent = ConcurrentService::new(vec![steady.clone(), flaky.clone()]).unwrap();

    parent.start().await.unwrap();
    assert!(steady.is_running());
    assert!(flaky.is_running());

    sleep(Duration::from_millis(150)).await;
    settle().await;
    // The member failed on its own; the parent keeps running.
    assert!(flaky.is_failed());
    assert!(parent.is_running());

    parent.stop().await;
    assert!(parent.is_stopped());
    assert!(steady.is_stopped());
    // The failed member stays failed; stop outside Running is ignored.
    assert!(flaky.is_failed());
}

#[tokio::test(start_paused = true)]
async fn concurrent_builder_exposes_a_facet() {
    init_logging();
    let first = Service::new("first", NoopBody);
    let second = Service::new("second", NoopBody);
    let facet = ConcurrentServiceBuilder::new()
        .add(first.clone())
        .add(second)
        .build()
        .unwrap();

    facet.service().start().await.unwrap();
    assert_eq!(facet.members().len(), 2);
    assert_eq!(facet.primary().name(), "first");
    assert!(facet.primary().is_running());

    facet.service().stop().await;
    assert!(first.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn chain_ties_follower_to_leader() {
    init_logging();
    let leader = Service::new("leader", NoopBody);
    let follower = Service::new("follower", NoopBody);
    let link = chain(&leader, &follower);

    leader.start().await.unwrap();
    settle().await;
    assert!(follower.is_running());

    leader.stop().await;
    settle().await;
    assert!(follower.is_stopped());

    link.unchain();
    leader.start().await.unwrap();
    settle().await;
    assert!(follower.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn chain_propagates_leader_failure() {
    init_logging();
    let leader = Service::new("leader", NoopBody);
    let follower = Service::new("follower", NoopBody);
    let _link = chain(&leader, &follower);

    leader.start().await.unwrap();
    settle().await;
    leader.notify_failed(ServiceError::failed("leader broke")).await;
    settle().await;

    assert!(follower.is_failed());
    assert_eq!(
        follower.failure_cause(),
        Some(ServiceError::failed("leader broke"))
    );
}

#[tokio::test(start_paused = true)]
async fn failure_dependency_is_one_way() {
    init_logging();
    let dependee = Service::new("dependee", NoopBody);
    let dependent = Service::new("dependent", NoopBody);
    let _link = failure_dependency(&dependee, &dependent);

    dependee.start().await.unwrap();
    dependent.start().await.unwrap();

    // Stopping the dependee does not touch the dependent.
    dependee.stop().await;
    settle().await;
    assert!(dependent.is_running());

    dependee.start().await.unwrap();
    dependee.notify_failed(ServiceError::failed("cascade")).await;
    settle().await;

    assert!(dependent.is_failed());
    assert_eq!(
        dependent.failure_cause(),
        Some(ServiceError::failed("cascade"))
    );
}
