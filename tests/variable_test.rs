//! Integration tests for the observable variable cell.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use common::{init_logging, settle};
use opvisor::{ValueInfo, Variable, VariableWatcher};

struct Recorder {
    seen: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl VariableWatcher<i64> for Recorder {
    async fn on_updated(&self, value: &ValueInfo<i64>) {
        self.seen.lock().unwrap().push(value.value);
    }
}

#[tokio::test(start_paused = true)]
async fn set_publishes_a_timestamped_cell() {
    init_logging();
    let var: Variable<i64> = Variable::new("gauge");
    assert!(var.value_info().is_none());

    let published = var.set(42);
    let read = var.value_info().unwrap();
    assert_eq!(read.value, 42);
    assert_eq!(read.modified_millis, published.modified_millis);
}

#[tokio::test(start_paused = true)]
async fn with_initial_does_not_notify() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let var = Variable::with_initial("gauge", 1i64);
    var.add_watcher(Arc::new(Recorder {
        seen: Arc::clone(&seen),
    }));

    settle().await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(var.value_info().unwrap().value, 1);
}

#[tokio::test(start_paused = true)]
async fn watchers_observe_updates() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let var: Variable<i64> = Variable::new("gauge");
    let id = var.add_watcher(Arc::new(Recorder {
        seen: Arc::clone(&seen),
    }));

    var.set(1);
    var.set(2);
    settle().await;

    let mut observed = seen.lock().unwrap().clone();
    observed.sort_unstable();
    assert_eq!(observed, vec![1, 2]);

    var.remove_watcher(id);
    var.set(3);
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn wait_update_returns_a_fresher_value() {
    init_logging();
    let var: Variable<i64> = Variable::new("gauge");
    let since = var.set(1).modified_millis;

    let waiter = {
        let var = var.clone();
        tokio::spawn(async move { var.wait_update(since).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    var.set(2);

    let fresh = waiter.await.unwrap().unwrap();
    assert_eq!(fresh.value, 2);
    assert!(fresh.modified_millis >= since);
}

#[tokio::test(start_paused = true)]
async fn wait_update_for_times_out() {
    init_logging();
    let var: Variable<i64> = Variable::new("gauge");
    let since = var.set(1).modified_millis;

    let stale = var
        .wait_update_for(since, Duration::from_millis(20))
        .await;
    assert!(stale.is_none());
}
