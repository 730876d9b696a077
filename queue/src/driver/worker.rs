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

//! Signal-driven background workers.
//!
//! A `Worker` runs a consumer-supplied work function whenever it is poked via
//! `signal_work_available`.  The work function is expected to internally loop
//! claim, process, remove until the queue yields nothing; the worker itself
//! knows nothing about queues and only provides the run-on-signal machinery.
//!
//! Signaling is level-triggered: a signal that arrives while the loop is busy
//! sets a pending flag that the loop consumes before parking again, so no
//! wake-up is ever lost.  Every worker owns its own signaling state; there
//! are no process-wide locks involved.

use crate::model::QueueResult;
use dbq_core::clocks::Clock;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};

/// Type-erased work function shared with the background loop.
type SharedWorkFn = Arc<dyn Fn() -> BoxFuture<'static, QueueResult<()>> + Send + Sync>;

/// Signaling state shared between a worker handle and its background loop.
struct Signals {
    /// Whether the loop should keep running.  Cleared by `stop`.
    running: AtomicBool,

    /// Level-triggered flag recording that work was signaled.  Consumed at
    /// the top of every loop iteration.
    pending: AtomicBool,

    /// Wakes the loop when it is parked waiting for a signal.
    work_available: Notify,

    /// Announces whether the loop is parked (idle) or processing.
    idle_tx: watch::Sender<bool>,

    /// Records when the work function last returned.
    last_finished_tx: watch::Sender<Option<OffsetDateTime>>,
}

/// A background execution unit that runs a work function on every signal.
///
/// The state machine is `Stopped -> Running -> (Idle <-> Draining) ->
/// Stopped`: `start` launches the loop, each signal moves it from idle to
/// draining, and `stop` makes it exit once the current work function
/// returns.  An error returned by the work function is logged and counts as
/// one failed cycle; it neither stops the loop nor reaches the controller.
pub struct Worker {
    /// Name of this worker, for diagnostics.
    name: String,

    /// Clock used to stamp work completion.
    clock: Arc<dyn Clock + Send + Sync>,

    /// The consumer-supplied work function.
    work: SharedWorkFn,

    /// State shared with the background loop.
    signals: Arc<Signals>,

    /// Receiving end of the idle announcements.
    idle_rx: watch::Receiver<bool>,

    /// Receiving end of the completion timestamps.
    last_finished_rx: watch::Receiver<Option<OffsetDateTime>>,
}

impl Worker {
    /// Creates a stopped worker named `name` that will run `work` on every
    /// signal once started.
    pub fn new<N, W, Fut>(name: N, clock: Arc<dyn Clock + Send + Sync>, work: W) -> Self
    where
        N: Into<String>,
        W: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<()>> + Send + 'static,
    {
        let (idle_tx, idle_rx) = watch::channel(true);
        let (last_finished_tx, last_finished_rx) = watch::channel(None);
        Self {
            name: name.into(),
            clock,
            work: Arc::new(move || work().boxed()),
            signals: Arc::new(Signals {
                running: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                work_available: Notify::new(),
                idle_tx,
                last_finished_tx,
            }),
            idle_rx,
            last_finished_rx,
        }
    }

    /// Returns the name of this worker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the background loop.  Does nothing if the worker is already
    /// running.
    pub fn start(&self) {
        if self.signals.running.swap(true, Ordering::SeqCst) {
            warn!("Worker {}: already running", self.name);
            return;
        }

        let name = self.name.clone();
        let clock = self.clock.clone();
        let work = self.work.clone();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            info!("Worker {}: started", name);
            while signals.running.load(Ordering::SeqCst) {
                if !signals.pending.swap(false, Ordering::SeqCst) {
                    // Nothing to do: announce idleness for any barrier
                    // waiters and park until the next signal.
                    let _ = signals.idle_tx.send(true);
                    signals.work_available.notified().await;
                    continue;
                }

                let _ = signals.idle_tx.send(false);
                if let Err(e) = work().await {
                    warn!("Worker {}: work function failed: {}", name, e);
                }
                let _ = signals.last_finished_tx.send(Some(clock.now_utc()));
            }
            let _ = signals.idle_tx.send(true);
            info!("Worker {}: stopped", name);
        });
    }

    /// Records that work is available and wakes the loop if it is parked.
    ///
    /// The signal is remembered if the loop is currently busy, so calling
    /// this at any time guarantees at least one further work cycle.
    pub fn signal_work_available(&self) {
        self.signals.pending.store(true, Ordering::SeqCst);
        self.signals.work_available.notify_one();
    }

    /// Blocks until the loop announces idleness.
    ///
    /// Returns immediately if the worker is already idle with no signal
    /// pending; otherwise waits for an idle announcement made after this
    /// call.  Note that a worker that was signaled but never started keeps
    /// its caller waiting until `start` is invoked.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.idle_rx.clone();
        {
            let idle = *rx.borrow_and_update();
            if idle && !self.signals.pending.load(Ordering::SeqCst) {
                return;
            }
        }
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Asks the loop to exit.  The loop finishes the work function it may be
    /// running first; nothing is interrupted forcefully.
    pub fn stop(&self) {
        self.signals.running.store(false, Ordering::SeqCst);
        self.signals.work_available.notify_one();
    }

    /// Returns the time at which the work function last returned, if it ever
    /// ran.
    pub fn last_finished(&self) -> Option<OffsetDateTime> {
        *self.last_finished_rx.borrow()
    }
}

/// A homogeneous group of workers addressed as one unit.
#[derive(Default)]
pub struct WorkerPool {
    /// The workers in this pool.
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `worker` to the pool.
    pub fn push(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    /// Returns the workers in this pool.
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Returns the number of workers in this pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if the pool holds no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Starts every worker.
    pub fn start_all(&self) {
        for worker in &self.workers {
            worker.start();
        }
    }

    /// Signals every worker that work is available.
    pub fn signal_all_work_available(&self) {
        for worker in &self.workers {
            worker.signal_work_available();
        }
    }

    /// Blocks until every worker is idle, one member at a time.
    pub async fn wait_until_all_idle(&self) {
        for worker in &self.workers {
            worker.wait_until_idle().await;
        }
    }

    /// Asks every worker to exit.
    pub fn stop_all(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Returns the most recent work completion time across all workers.
    pub fn last_finished(&self) -> Option<OffsetDateTime> {
        self.workers.iter().filter_map(Worker::last_finished).max()
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::driver::testutils::*;
    use dbq_core::clocks::SystemClock;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Shorthand for the clock used throughout these tests.
    fn clock() -> Arc<dyn Clock + Send + Sync> {
        Arc::from(SystemClock::default())
    }

    #[tokio::test]
    async fn test_worker_drains_queue_on_signal() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));
        let worker = Worker::new("w0", clock(), drain_fn(&queue, &processed));

        for n in 0..3 {
            queue.enqueue(&TestItem { n }).await.unwrap();
        }

        worker.start();
        worker.signal_work_available();
        worker.wait_until_idle().await;

        assert_eq!(3, processed.load(Ordering::SeqCst));
        assert_eq!(0, queue.size().await.unwrap());
        assert!(worker.last_finished().is_some());
    }

    #[tokio::test]
    async fn test_signal_before_start_is_not_lost() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));
        let worker = Worker::new("w0", clock(), drain_fn(&queue, &processed));

        queue.enqueue(&TestItem { n: 1 }).await.unwrap();
        worker.signal_work_available();
        worker.start();
        worker.wait_until_idle().await;

        assert_eq!(1, processed.load(Ordering::SeqCst));
    }

    /// Work function that records its invocation and then waits for a permit
    /// before draining the queue.
    async fn gated_drain(
        queue: crate::Queue<TestItem>,
        invocations: Arc<AtomicUsize>,
        gate: Arc<tokio::sync::Semaphore>,
    ) -> crate::model::QueueResult<()> {
        invocations.fetch_add(1, Ordering::SeqCst);
        let _permit = gate.acquire().await.expect("Gate never closes");
        while let Some(item) = queue.claim_next().await? {
            queue.remove(item.id()).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_signal_while_busy_is_not_lost() {
        let queue = setup_queue("tasks").await;
        let invocations = Arc::from(AtomicUsize::new(0));
        let gate = Arc::from(tokio::sync::Semaphore::new(0));

        let work = {
            let queue = queue.clone();
            let invocations = invocations.clone();
            let gate = gate.clone();
            move || gated_drain(queue.clone(), invocations.clone(), gate.clone())
        };
        let worker = Worker::new("w0", clock(), work);
        worker.start();

        // First signal: the work function starts and blocks on the gate.
        queue.enqueue(&TestItem { n: 1 }).await.unwrap();
        worker.signal_work_available();
        while invocations.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Second signal while the loop is busy must be remembered.
        queue.enqueue(&TestItem { n: 2 }).await.unwrap();
        worker.signal_work_available();

        gate.add_permits(2);
        worker.wait_until_idle().await;

        assert!(invocations.load(Ordering::SeqCst) >= 2, "Pending signal was lost");
        assert_eq!(0, queue.size().await.unwrap());
    }

    /// Work function that fails its first cycle and drains on later ones.
    async fn drain_after_one_failure(
        queue: crate::Queue<TestItem>,
        processed: Arc<AtomicUsize>,
        fail_once: Arc<AtomicBool>,
    ) -> crate::model::QueueResult<()> {
        if fail_once.swap(false, Ordering::SeqCst) {
            return Err(crate::model::QueueError::Config("boom".to_owned()));
        }
        while let Some(item) = queue.claim_next().await? {
            queue.remove(item.id()).await?;
            processed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_work_function_error_does_not_stop_worker() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));
        let fail_once = Arc::from(AtomicBool::new(true));

        let work = {
            let queue = queue.clone();
            let processed = processed.clone();
            let fail_once = fail_once.clone();
            move || drain_after_one_failure(queue.clone(), processed.clone(), fail_once.clone())
        };
        let worker = Worker::new("w0", clock(), work);
        worker.start();

        queue.enqueue(&TestItem { n: 1 }).await.unwrap();

        // The first cycle fails without draining anything.
        worker.signal_work_available();
        worker.wait_until_idle().await;

        // The loop must still be alive to serve the next signal.
        worker.signal_work_available();
        worker.wait_until_idle().await;

        assert_eq!(1, processed.load(Ordering::SeqCst));
        assert_eq!(0, queue.size().await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_until_idle_returns_immediately_when_idle() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));
        let worker = Worker::new("w0", clock(), drain_fn(&queue, &processed));

        // Not started, nothing pending: the barrier must not block.
        worker.wait_until_idle().await;

        worker.start();
        worker.wait_until_idle().await;
    }

    #[tokio::test]
    async fn test_stop_exits_without_processing_new_signals() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));
        let worker = Worker::new("w0", clock(), drain_fn(&queue, &processed));

        worker.start();
        worker.wait_until_idle().await;
        worker.stop();

        queue.enqueue(&TestItem { n: 1 }).await.unwrap();
        worker.signal_work_available();

        // Give the loop a chance to misbehave before checking that it did
        // not pick up the signal.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(0, processed.load(Ordering::SeqCst));
        assert_eq!(1, queue.size().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_twice_is_harmless() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));
        let worker = Worker::new("w0", clock(), drain_fn(&queue, &processed));

        worker.start();
        worker.start();

        queue.enqueue(&TestItem { n: 1 }).await.unwrap();
        worker.signal_work_available();
        worker.wait_until_idle().await;
        assert_eq!(1, processed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_drains_everything_after_two_signals() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));

        let mut pool = WorkerPool::new();
        for i in 0..10 {
            pool.push(Worker::new(format!("w{}", i), clock(), drain_fn(&queue, &processed)));
        }
        pool.start_all();

        for n in 0..50 {
            queue.enqueue(&TestItem { n }).await.unwrap();
        }
        pool.signal_all_work_available();

        for n in 50..100 {
            queue.enqueue(&TestItem { n }).await.unwrap();
        }
        pool.signal_all_work_available();

        pool.wait_until_all_idle().await;

        assert_eq!(100, processed.load(Ordering::SeqCst));
        assert_eq!(0, queue.size().await.unwrap());
        assert!(pool.last_finished().is_some());

        pool.stop_all();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_random_poking_smoke() {
        let queue = setup_queue("tasks").await;
        let processed = Arc::from(AtomicUsize::new(0));

        let mut pool = WorkerPool::new();
        for i in 0..3 {
            pool.push(Worker::new(format!("w{}", i), clock(), drain_fn(&queue, &processed)));
        }
        pool.start_all();

        for n in 0..60 {
            queue.enqueue(&TestItem { n }).await.unwrap();
            if n % 10 == 0 {
                let i = rand::random::<usize>() % pool.len();
                pool.workers()[i].signal_work_available();
            }
        }
        pool.signal_all_work_available();
        pool.wait_until_all_idle().await;

        assert_eq!(60, processed.load(Ordering::SeqCst));
        assert_eq!(0, queue.size().await.unwrap());
    }
}
