//! Elastic worker pool for parallel tool execution.
//!
//! Jobs go into an unbounded queue shared by all workers. Workers are
//! spawned on demand: up to `core_workers` are always kept, and while more
//! jobs are waiting than there are idle workers the pool grows towards
//! `max_workers`. Workers above the core size exit after `keep_alive`
//! without work. Dropping the pool stops all workers once they finish their
//! current job.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cadence_config::AppConfig;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub core_workers: usize,
    pub max_workers: usize,
    pub keep_alive: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            core_workers: config.tools.core_workers,
            max_workers: config.tools.max_workers,
            keep_alive: Duration::from_secs(config.tools.keep_alive_secs),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            core_workers: 4,
            max_workers: 8,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// A submitted job did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was dropped before completing")]
    Dropped,
}

/// Awaitable result of a submitted job.
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    pub async fn join(self) -> Result<T, TaskFailure> {
        match self.receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(TaskFailure::Panicked(message)),
            Err(_) => Err(TaskFailure::Dropped),
        }
    }
}

struct PoolShared {
    sender: mpsc::UnboundedSender<Job>,
    receiver: Mutex<mpsc::UnboundedReceiver<Job>>,
    live: AtomicUsize,
    busy: AtomicUsize,
    /// Submitted jobs no worker has picked up yet
    waiting: AtomicUsize,
    settings: PoolSettings,
    shutdown: CancellationToken,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings) -> Self {
        let settings = PoolSettings {
            core_workers: settings.core_workers.max(1),
            max_workers: settings.max_workers.max(settings.core_workers.max(1)),
            keep_alive: settings.keep_alive,
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(PoolShared {
                sender,
                receiver: Mutex::new(receiver),
                live: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue a job. A panic inside the job is caught and reported through
    /// the handle.
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, receiver) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(panic_message);
            let _ = tx.send(outcome);
        });

        self.shared.waiting.fetch_add(1, Ordering::SeqCst);
        // The pool owns the receiving half, so the queue cannot be closed here.
        if self.shared.sender.send(job).is_err() {
            trace!("Worker queue closed, job dropped");
        }
        PoolShared::ensure_worker(&self.shared);
        TaskHandle { receiver }
    }

    /// Workers currently alive, idle or busy.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl PoolShared {
    fn ensure_worker(shared: &Arc<Self>) {
        loop {
            let live = shared.live.load(Ordering::SeqCst);
            let idle = live.saturating_sub(shared.busy.load(Ordering::SeqCst));
            let waiting = shared.waiting.load(Ordering::SeqCst);
            let wanted = live < shared.settings.core_workers
                || (waiting > idle && live < shared.settings.max_workers);
            if !wanted {
                return;
            }
            if shared
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!(workers = live + 1, "Spawning pool worker");
                let slot = WorkerSlot::new(Arc::clone(shared));
                tokio::spawn(Self::run_worker(Arc::clone(shared), slot));
                return;
            }
        }
    }

    async fn next_job(&self) -> Option<Job> {
        self.receiver.lock().await.recv().await
    }

    /// Give up a worker slot if the pool is above its core size.
    fn try_retire(&self) -> bool {
        loop {
            let live = self.live.load(Ordering::SeqCst);
            if live <= self.settings.core_workers {
                return false;
            }
            if self
                .live
                .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    async fn run_worker(shared: Arc<Self>, mut slot: WorkerSlot) {
        loop {
            let next = tokio::select! {
                _ = shared.shutdown.cancelled() => None,
                next = tokio::time::timeout(shared.settings.keep_alive, shared.next_job()) => Some(next),
            };

            match next {
                Some(Ok(Some(job))) => {
                    slot.start_job();
                    job.await;
                    slot.finish_job();
                }
                Some(Err(_idle)) => {
                    if shared.try_retire() {
                        slot.retired = true;
                        debug!("Idle pool worker retired");
                        return;
                    }
                }
                None | Some(Ok(None)) => return,
            }
        }
    }
}

/// A worker's claim on the `live` count, and on `busy` while it runs a job.
/// Taken before the worker is spawned and released on drop, including when
/// the runtime drops the worker task.
struct WorkerSlot {
    shared: Arc<PoolShared>,
    busy: bool,
    /// `try_retire` already gave the slot back
    retired: bool,
}

impl WorkerSlot {
    fn new(shared: Arc<PoolShared>) -> Self {
        Self {
            shared,
            busy: false,
            retired: false,
        }
    }

    fn start_job(&mut self) {
        self.shared.busy.fetch_add(1, Ordering::SeqCst);
        self.shared.waiting.fetch_sub(1, Ordering::SeqCst);
        self.busy = true;
    }

    fn finish_job(&mut self) {
        self.shared.busy.fetch_sub(1, Ordering::SeqCst);
        self.busy = false;
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.busy {
            self.shared.busy.fetch_sub(1, Ordering::SeqCst);
        }
        if !self.retired {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
