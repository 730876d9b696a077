// DBQ
// Copyright 2024 The DBQ Authors
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Self-contained queue consumer with a bounded handler pool.
//!
//! The executor owns one poller task that claims items for as long as there
//! are any and hands each one to the caller-supplied handler, with at most
//! `pool_size` handlers running concurrently.  An item is removed from the
//! queue only when its handler returns success; a failed handler leaves the
//! item claimed in storage, where it stays until an operator deals with it.
//!
//! The poller parks while holding no database state, either indefinitely or
//! for the configured poll interval, and wakes on explicit notification.
//! Items enqueued through `QueueExecutor::enqueue` notify automatically;
//! items enqueued by other processes are picked up by the next poll
//! interval tick or explicit `notify` call.

use crate::model::{QueueError, QueueItem, QueueResult};
use crate::Queue;
use dbq_core::env::get_optional_var;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

/// Default number of concurrently running handlers.
const DEFAULT_POOL_SIZE: usize = 10;

/// Default grace period, in seconds, granted to in-flight handlers at
/// shutdown time.
const DEFAULT_GRACE_PERIOD_SECS: u64 = 60;

/// Configuration options for the queue executor.
#[derive(Clone, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ExecutorOptions {
    /// Maximum number of handlers running concurrently.
    pub pool_size: usize,

    /// How long the poller sleeps before re-checking the queue on its own.
    /// `None` makes it wait indefinitely for an explicit notification, which
    /// is appropriate when all producers go through this executor.
    pub poll_interval: Option<Duration>,

    /// How long `shutdown` waits for in-flight handlers before abandoning
    /// them.
    pub grace_period: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            poll_interval: None,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
        }
    }
}

impl ExecutorOptions {
    /// Creates a new set of options from environment variables.
    ///
    /// This will use variables such as `<prefix>_POOL_SIZE`,
    /// `<prefix>_POLL_INTERVAL_MS` and `<prefix>_GRACE_PERIOD_SECS`.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        Ok(Self {
            pool_size: get_optional_var::<usize>(prefix, "POOL_SIZE")?
                .unwrap_or(DEFAULT_POOL_SIZE),
            poll_interval: get_optional_var::<u64>(prefix, "POLL_INTERVAL_MS")?
                .map(Duration::from_millis),
            grace_period: get_optional_var::<u64>(prefix, "GRACE_PERIOD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS)),
        })
    }
}

/// State shared between the executor handle, its poller, and the handler
/// tasks.
struct Shared {
    /// Whether the poller should keep running.  Cleared by `shutdown`.
    active: AtomicBool,

    /// Wakes the poller when it is parked between drain bursts.
    wakeup: Notify,

    /// Gates how many handlers run concurrently.
    permits: Arc<Semaphore>,

    /// Number of dispatched handler tasks that have not finished yet.
    in_flight: AtomicUsize,

    /// Signaled every time a handler task finishes.
    task_done: Notify,
}

/// A consumer that continuously claims items and dispatches them to a
/// bounded pool of handlers.
pub struct QueueExecutor<T>
where
    T: Send + Sync,
{
    /// The queue this executor consumes from (and can produce into).
    queue: Queue<T>,

    /// State shared with the poller and the handler tasks.
    shared: Arc<Shared>,

    /// Handle of the poller task, consumed by `shutdown`.
    poller: Mutex<Option<JoinHandle<()>>>,

    /// How long `shutdown` waits for in-flight handlers.
    grace_period: Duration,
}

impl<T> QueueExecutor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates an executor over `queue` and starts its poller immediately.
    ///
    /// Every claimed item is passed to `handler`; a handler that returns
    /// `Ok(())` reports the item as done, which is the one and only trigger
    /// for removing it from the queue.
    pub fn new<H, Fut>(queue: Queue<T>, opts: ExecutorOptions, handler: H) -> QueueResult<Self>
    where
        H: Fn(QueueItem<T>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        if opts.pool_size == 0 {
            return Err(QueueError::Config("pool_size must be at least 1".to_owned()));
        }

        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            wakeup: Notify::new(),
            permits: Arc::new(Semaphore::new(opts.pool_size)),
            in_flight: AtomicUsize::new(0),
            task_done: Notify::new(),
        });
        let poller =
            tokio::spawn(poller_loop(queue.clone(), shared.clone(), opts.poll_interval, handler));
        Ok(Self { queue, shared, poller: Mutex::new(Some(poller)), grace_period: opts.grace_period })
    }

    /// Appends `item` to the queue and wakes the poller.
    pub async fn enqueue(&self, item: &T) -> QueueResult<()> {
        self.queue.enqueue(item).await?;
        self.notify();
        Ok(())
    }

    /// Wakes the poller so it re-checks the queue.
    ///
    /// Useful when items were enqueued by some other process sharing the
    /// same backing store.
    pub fn notify(&self) {
        self.shared.wakeup.notify_one();
    }

    /// Stops the executor.
    ///
    /// The poller finishes a final drain of whatever is already enqueued and
    /// exits; in-flight handlers then get up to the configured grace period
    /// to finish.  Handlers still running after that are abandoned and their
    /// items remain claimed in storage.  Calling this more than once is
    /// harmless.
    pub async fn shutdown(&self) {
        info!("Queue {}: stopping executor", self.queue.name());
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.wakeup.notify_one();

        if let Some(poller) = self.poller.lock().await.take() {
            if let Err(e) = poller.await {
                warn!("Queue {}: poller task did not exit cleanly: {}", self.queue.name(), e);
            }
        }

        let drained = async {
            loop {
                let notified = self.shared.task_done.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.grace_period, drained).await.is_err() {
            warn!(
                "Queue {}: {} handler(s) still running after the grace period; abandoning them",
                self.queue.name(),
                self.shared.in_flight.load(Ordering::SeqCst)
            );
        }
        info!("Queue {}: executor stopped", self.queue.name());
    }
}

/// Body of the poller task: drain the queue, then park until woken or until
/// the poll interval elapses.
///
/// Draining happens before the deactivation check so that a shutdown issued
/// right after a burst of enqueues still sees those items dispatched.
async fn poller_loop<T, H, Fut>(
    queue: Queue<T>,
    shared: Arc<Shared>,
    poll_interval: Option<Duration>,
    handler: H,
) where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: Fn(QueueItem<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    info!("Queue {}: executor poller started", queue.name());
    loop {
        loop {
            match queue.claim_next().await {
                Ok(Some(item)) => {
                    shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    let queue = queue.clone();
                    let shared = shared.clone();
                    let handler = handler.clone();
                    tokio::spawn(run_one(queue, shared, handler, item));
                }

                Ok(None) => break,

                Err(e @ QueueError::Serialization(_)) => {
                    // The offending item is now claimed and will not come
                    // back; keep draining whatever follows it.
                    warn!("Queue {}: skipping undecodable claimed item: {}", queue.name(), e);
                }

                Err(e) => {
                    warn!("Queue {}: claim failed: {}", queue.name(), e);
                    break;
                }
            }
        }

        if !shared.active.load(Ordering::SeqCst) {
            break;
        }

        match poll_interval {
            Some(interval) => {
                let _ = tokio::time::timeout(interval, shared.wakeup.notified()).await;
            }
            None => shared.wakeup.notified().await,
        }
    }
    info!("Queue {}: executor poller stopped", queue.name());
}

/// Body of one handler task: run the handler under a pool permit and remove
/// the item if and only if the handler reports completion.
async fn run_one<T, H, Fut>(queue: Queue<T>, shared: Arc<Shared>, handler: H, item: QueueItem<T>)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: Fn(QueueItem<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    if let Ok(_permit) = shared.permits.clone().acquire_owned().await {
        let id = item.id();
        match handler(item).await {
            Ok(()) => {
                if let Err(e) = queue.remove(id).await {
                    warn!("Queue {}: cannot remove completed item {}: {}", queue.name(), id, e);
                }
            }
            Err(e) => {
                warn!(
                    "Queue {}: handler for item {} failed; the item remains claimed: {}",
                    queue.name(),
                    id,
                    e
                );
            }
        }
    }
    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    shared.task_done.notify_waiters();
}
