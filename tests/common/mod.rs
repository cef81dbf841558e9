//! Shared helpers for the integration tests: logging init, event-trace
//! sinks, and a scheduler-friendly settle point for listener workers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;

use opvisor::{EventSink, OpEvent, OpState, ServiceEvent, ServiceState};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or("debug");
        let _ = env_logger::Builder::from_env(env).is_test(true).try_init();
    });
}

/// Lets spawned workers (drivers, listener queues) drain. Virtual time
/// auto-advances through the sleep once every task is idle.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Event-sink listener recording service transitions in arrival order.
#[derive(Clone, Default)]
pub struct ServiceTrace {
    events: Arc<Mutex<Vec<(ServiceState, ServiceState)>>>,
}

impl ServiceTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<(ServiceState, ServiceState)> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EventSink<ServiceEvent> for ServiceTrace {
    async fn on_event(&self, event: &ServiceEvent) {
        self.events.lock().unwrap().push((event.from, event.to));
    }
}

/// Event-sink listener recording operation transitions in arrival order.
#[derive(Clone, Default)]
pub struct OpTrace {
    events: Arc<Mutex<Vec<OpState>>>,
}

impl OpTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<OpState> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EventSink<OpEvent> for OpTrace {
    async fn on_event(&self, event: &OpEvent) {
        self.events.lock().unwrap().push(event.to);
    }
}
