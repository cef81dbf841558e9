//! # Observable variables.
//!
//! A [`Variable`] is a producer/consumer cell holding a timestamped
//! [`ValueInfo`]. Consumers read the current value, register update
//! watchers (dispatched asynchronously, errors logged and ignored), or
//! wait — optionally with a deadline — for a value newer than a given
//! timestamp.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;

use crate::events::ListenerId;
use crate::relock;

const LOG_TARGET: &str = "VAR.SIMPLE";
const SUPPORT_TARGET: &str = "VAR.SUPPORT";

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// A value paired with its modification timestamp. Immutable once
/// published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueInfo<T> {
    /// The value.
    pub value: T,
    /// Wall-clock modification time, in milliseconds since the epoch.
    pub modified_millis: u64,
}

impl<T> ValueInfo<T> {
    /// Stamps `value` with the current time.
    pub fn new(value: T) -> Self {
        Self {
            value,
            modified_millis: now_millis(),
        }
    }

    /// Pairs `value` with an explicit timestamp.
    pub fn at(value: T, modified_millis: u64) -> Self {
        Self {
            value,
            modified_millis,
        }
    }
}

impl<T: std::fmt::Display> std::fmt::Display for ValueInfo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(modified={})", self.value, self.modified_millis)
    }
}

/// Watcher of variable updates.
#[async_trait]
pub trait VariableWatcher<T: Clone + Send + Sync + 'static>: Send + Sync + 'static {
    /// Called for every published update.
    async fn on_updated(&self, value: &ValueInfo<T>);
}

struct VarInner<T: Clone + Send + Sync + 'static> {
    name: Arc<str>,
    current: Mutex<Option<ValueInfo<T>>>,
    /// Carries the timestamp of the latest update for timed waits.
    modified_tx: watch::Sender<u64>,
    watchers: Mutex<Vec<(ListenerId, Arc<dyn VariableWatcher<T>>)>>,
    next_id: AtomicU64,
}

/// An observable variable cell.
#[derive(Clone)]
pub struct Variable<T: Clone + Send + Sync + 'static> {
    inner: Arc<VarInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Variable<T> {
    /// Creates an empty variable.
    pub fn new(name: impl Into<String>) -> Self {
        let (modified_tx, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(VarInner {
                name: Arc::from(name.into().as_str()),
                current: Mutex::new(None),
                modified_tx,
                watchers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a variable with an initial value (no update is published).
    pub fn with_initial(name: impl Into<String>, value: T) -> Self {
        let variable = Self::new(name);
        *relock(&variable.inner.current) = Some(ValueInfo::new(value));
        variable
    }

    /// The variable's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Publishes a new value stamped with the current time and notifies
    /// watchers asynchronously. Returns the published cell.
    ///
    /// Stamps are strictly monotonic per variable, so a timed wait never
    /// misses an update landing within the same millisecond.
    pub fn set(&self, value: T) -> ValueInfo<T> {
        let info = {
            let mut current = relock(&self.inner.current);
            let stamp = match current.as_ref() {
                Some(previous) => now_millis().max(previous.modified_millis + 1),
                None => now_millis(),
            };
            let info = ValueInfo::at(value, stamp);
            *current = Some(info.clone());
            let _ = self.inner.modified_tx.send(stamp);
            info
        };
        log::debug!(
            target: LOG_TARGET,
            "updated: var={}, modified={}",
            self.inner.name,
            info.modified_millis
        );

        let watchers: Vec<(ListenerId, Arc<dyn VariableWatcher<T>>)> =
            relock(&self.inner.watchers).clone();
        for (_, watcher) in watchers {
            let info = info.clone();
            let name = Arc::clone(&self.inner.name);
            tokio::spawn(async move {
                if AssertUnwindSafe(watcher.on_updated(&info))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    log::warn!(
                        target: SUPPORT_TARGET,
                        "(ignored) fails to notify variable update: var={name}"
                    );
                }
            });
        }
        info
    }

    /// The current cell, if any.
    pub fn value_info(&self) -> Option<ValueInfo<T>> {
        relock(&self.inner.current).clone()
    }

    /// Waits for a value published strictly after `since_millis` and
    /// returns it.
    pub async fn wait_update(&self, since_millis: u64) -> Option<ValueInfo<T>> {
        let mut rx = self.inner.modified_tx.subscribe();
        if rx.wait_for(|m| *m > since_millis).await.is_err() {
            return None;
        }
        self.value_info()
    }

    /// Bounded [`wait_update`](Self::wait_update); `None` on timeout.
    pub async fn wait_update_for(
        &self,
        since_millis: u64,
        timeout: Duration,
    ) -> Option<ValueInfo<T>> {
        tokio::time::timeout(timeout, self.wait_update(since_millis))
            .await
            .ok()
            .flatten()
    }

    /// Registers an update watcher.
    pub fn add_watcher(&self, watcher: Arc<dyn VariableWatcher<T>>) -> ListenerId {
        let id = ListenerId::new(self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        relock(&self.inner.watchers).push((id, watcher));
        id
    }

    /// Deregisters an update watcher.
    pub fn remove_watcher(&self, id: ListenerId) {
        relock(&self.inner.watchers).retain(|(wid, _)| *wid != id);
    }
}
