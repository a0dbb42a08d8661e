//! Priority request queue: bounded concurrency, bounded depth, coalescing,
//! and FIFO-within-band dispatch (§4.5).
//!
//! Concurrency limiting follows the teacher's bulkhead
//! (`tower-resilience-bulkhead::service::Bulkhead`, a `tokio::sync::Semaphore`
//! around the inner call) and coalescing follows the teacher's singleflight
//! (`tower-resilience-coalesce::service::CoalesceService`, a
//! `hashbrown::HashMap` of `tokio::sync::broadcast` senders guarded by
//! `parking_lot::Mutex`). Priority admission and a standalone dispatcher loop
//! are new: the teacher's services gate a single `tower::Service::call`
//! inline, but this design needs a queue that a dispatcher drains
//! out-of-band so that popping the next request never waits on the
//! previous one finishing.
//!
//! Unlike the teacher's per-service coalescing, one queue here is shared by
//! every RPC the façade exposes, so admission and concurrency are governed
//! crate-wide rather than per call shape. That means the in-flight
//! coalescing map can't be generic over a single response type; it keeps
//! `Box<dyn Any>` per key instead and relies on the invariant that a given
//! coalesce key is always associated with calls returning the same `T`
//! (true in practice since a key encodes the operation name and arguments).

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, Notify, Semaphore};

use crate::classify::OperationCriticality;
use crate::error::BridgeError;

type PendingJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedJob {
    job: PendingJob,
}

/// In-flight request tracker for coalescing identical concurrent calls,
/// keyed by an operation-defined string (e.g. `"symbol_info:EURUSD"`).
#[derive(Default)]
struct InFlight {
    requests: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl InFlight {
    fn new() -> Self {
        Self::default()
    }

    fn try_join<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Option<broadcast::Receiver<Result<T, String>>> {
        let mut requests = self.requests.lock();
        if let Some(boxed) = requests.get(key) {
            let sender = boxed
                .downcast_ref::<broadcast::Sender<Result<T, String>>>()
                .expect("coalesce key reused with a different response type");
            Some(sender.subscribe())
        } else {
            let (tx, _rx) = broadcast::channel::<Result<T, String>>(1);
            requests.insert(key.to_string(), Box::new(tx));
            None
        }
    }

    fn complete<T: Clone + Send + Sync + 'static>(&self, key: &str, result: Result<T, String>) {
        let mut requests = self.requests.lock();
        if let Some(boxed) = requests.remove(key) {
            if let Ok(sender) = boxed.downcast::<broadcast::Sender<Result<T, String>>>() {
                let _ = sender.send(result);
            }
        }
    }
}

/// Bounded, prioritized, coalescing request queue (§4.5), shared across
/// every call the façade makes.
pub struct RequestQueue {
    bands: Mutex<[VecDeque<QueuedJob>; 4]>,
    depth: AtomicUsize,
    max_depth: usize,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    shutting_down: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl RequestQueue {
    /// Creates a queue with the given concurrency cap and maximum queued
    /// depth (`Config::queue_max_concurrent` / `Config::queue_max_depth`).
    pub fn new(max_concurrent: usize, max_depth: usize) -> Arc<Self> {
        let queue = Arc::new(Self {
            bands: Mutex::new(Default::default()),
            depth: AtomicUsize::new(0),
            max_depth,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::new()),
        });
        queue.clone().spawn_dispatcher();
        queue
    }

    /// Current queued (not yet dispatched) depth, for monitoring.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Submits `work` at `priority`, optionally coalesced with any other
    /// in-flight call sharing `coalesce_key`.
    ///
    /// Returns `Err(BridgeError::QueueFull)` immediately if admission would
    /// exceed `max_depth`, without ever running `work`.
    pub async fn submit<T, F, Fut>(
        &self,
        priority: OperationCriticality,
        coalesce_key: Option<&str>,
        work: F,
    ) -> Result<T, BridgeError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BridgeError>> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection);
        }

        if let Some(key) = coalesce_key {
            if let Some(mut receiver) = self.in_flight.try_join::<T>(key) {
                return receiver
                    .recv()
                    .await
                    .map_err(|_| BridgeError::Operation("coalesce leader dropped".to_string()))?
                    .map_err(BridgeError::Operation);
            }
        }

        let depth = self.depth.fetch_add(1, Ordering::SeqCst);
        if depth >= self.max_depth {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            if let Some(key) = coalesce_key {
                self.in_flight
                    .complete::<T>(key, Err("queue full".to_string()));
            }
            return Err(BridgeError::QueueFull {
                depth,
                max_depth: self.max_depth,
            });
        }

        let (tx, rx) = oneshot::channel::<Result<T, BridgeError>>();
        let in_flight = self.in_flight.clone();
        let coalesce_key = coalesce_key.map(str::to_string);
        let job: PendingJob = Box::pin(async move {
            let result = work().await;
            if let Some(key) = &coalesce_key {
                let broadcastable = result.as_ref().map(|v| v.clone()).map_err(|e| e.to_string());
                in_flight.complete::<T>(key, broadcastable);
            }
            let _ = tx.send(result);
        });

        {
            let mut bands = self.bands.lock();
            bands[band_index(priority)].push_back(QueuedJob { job });
        }
        self.notify.notify_one();

        rx.await
            .map_err(|_| BridgeError::Operation("dispatcher dropped job".to_string()))?
    }

    /// Stops admitting new work. Already-queued and in-flight jobs still
    /// drain; the dispatcher task exits once both are empty.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Drains the bands one job at a time. The dispatcher itself blocks on
    /// `semaphore.acquire_owned()` before spawning the job's task, holding
    /// the permit across the spawn — popping a job off a band is not enough
    /// to count it as in-flight admission, so a permit must be in hand
    /// before the dispatcher goes back for the next one (§4.5, testable
    /// property: queued + in-flight <= queue_max_depth + queue_max_concurrent).
    fn spawn_dispatcher(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut bands = self.bands.lock();
                    bands.iter_mut().find_map(|band| band.pop_front())
                };
                if next.is_some() {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                }

                match next {
                    Some(queued) => {
                        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                            return;
                        };
                        tokio::spawn(async move {
                            let _permit = permit;
                            queued.job.await;
                        });
                    }
                    None => {
                        if self.shutting_down.load(Ordering::SeqCst) {
                            return;
                        }
                        self.notify.notified().await;
                    }
                }
            }
        });
    }
}

fn band_index(priority: OperationCriticality) -> usize {
    match priority {
        OperationCriticality::Critical => 0,
        OperationCriticality::High => 1,
        OperationCriticality::Normal => 2,
        OperationCriticality::Low => 3,
    }
}
