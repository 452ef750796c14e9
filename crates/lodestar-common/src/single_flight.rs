//! Request coalescing keyed by an arbitrary value.
//!
//! At most one operation runs per key. Callers arriving while it runs share
//! its result. The operation runs on its own task, so it keeps going when
//! every waiter gives up, and its entry leaves the table as the task finishes.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::protocol::{LodestarError, Result};

/// Outcome shared between every waiter of one flight.
pub type SharedResult<V> = std::result::Result<V, Arc<LodestarError>>;

/// Handle on a running flight; clone it to wait from several places.
pub type Pending<V> = Shared<BoxFuture<'static, SharedResult<V>>>;

struct Flight<V> {
    id: u64,
    task: Pending<V>,
}

/// Removes a flight from the table once its task is done, even on panic.
struct Landing<K: Eq + Hash, V> {
    owner: Weak<SingleFlight<K, V>>,
    key: Option<K>,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for Landing<K, V> {
    fn drop(&mut self) {
        let (Some(owner), Some(key)) = (self.owner.upgrade(), self.key.take()) else {
            return;
        };
        let mut flights = owner.lock();
        if flights.get(&key).map(|flight| flight.id) == Some(self.id) {
            flights.remove(&key);
        }
    }
}

pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Flight<V>>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash, V> SingleFlight<K, V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Flight<V>>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Joins the flight for `key`, starting `operation` if none is running.
    ///
    /// `operation` is only called when a new flight starts.
    pub fn start<F, Fut>(self: &Arc<Self>, key: K, operation: F) -> Pending<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut flights = self.lock();
        if let Some(flight) = flights.get(&key) {
            return flight.task.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let landing = Landing {
            owner: Arc::downgrade(self),
            key: Some(key.clone()),
            id,
        };
        let work = operation();
        let handle = tokio::spawn(async move {
            let _landing = landing;
            work.await.map_err(Arc::new)
        });
        let task = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(Arc::new(LodestarError::Internal(format!(
                    "coalesced task failed: {}",
                    join_error
                )))),
            }
        }
        .boxed()
        .shared();

        flights.insert(
            key,
            Flight {
                id,
                task: task.clone(),
            },
        );
        task
    }

    /// Waits for the flight for `key`, abandoning the wait if `cancel` fires.
    ///
    /// Cancelling one waiter never cancels the operation itself.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: K, operation: F, cancel: &CancellationToken) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let pending = self.start(key, operation);
        cancellable(cancel, pending)
            .await?
            .map_err(LodestarError::Shared)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_operation() {
        let flights: Arc<SingleFlight<&'static str, u32>> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let calls = calls.clone();
            let release = release.clone();
            waiters.push(flights.start("adapter", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok(42)
            }));
        }
        assert!(flights.is_pending(&"adapter"));
        release.notify_one();

        let results = futures::future::join_all(waiters).await;
        assert!(results.iter().all(|r| matches!(r, Ok(42))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_waiters_share_the_same_error() {
        let flights: Arc<SingleFlight<u8, u32>> = SingleFlight::new();
        let first = flights.start(1, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(LodestarError::ConnectFailed("h:1".into()))
        });
        let second = flights.start(1, || async { Ok(1) });

        let (a, b) = futures::join!(first, second);
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_connect_failure());
    }

    #[tokio::test]
    async fn test_entry_removed_after_completion() {
        let flights: Arc<SingleFlight<u8, u32>> = SingleFlight::new();
        let token = CancellationToken::new();
        assert_eq!(flights.run(1, || async { Ok(1) }, &token).await.unwrap(), 1);
        assert!(!flights.is_pending(&1));

        assert_eq!(flights.run(1, || async { Ok(2) }, &token).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_stop_operation() {
        let flights: Arc<SingleFlight<u8, u32>> = SingleFlight::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let token = CancellationToken::new();
        token.cancel();

        let op_finished = finished.clone();
        let op_release = release.clone();
        let result = flights
            .run(
                1,
                move || async move {
                    op_release.notified().await;
                    op_finished.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                },
                &token,
            )
            .await;
        assert!(matches!(result, Err(LodestarError::Cancelled)));

        // a later waiter joins the still-running flight
        let pending = flights.start(1, || async { Ok(0) });
        release.notify_one();
        assert_eq!(pending.await.unwrap(), 7);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
