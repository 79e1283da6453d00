//! Fixed worker pools isolating message-handling work by class.
//!
//! Gossip must not be starved by request traffic, so each stage owns its own
//! queue and workers. The mapping from verb to stage is static; callers only
//! ever see `submit`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

/// Worker-pool identity a verb handler executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Replies to client-facing requests.
    RequestResponse,
    /// Replies to internal calls, plus failure notifications.
    InternalResponse,
    /// Gossip rounds and liveness probes.
    Gossip,
}

impl Stage {
    /// All stages, in executor order.
    pub const ALL: [Self; 3] = [Self::RequestResponse, Self::InternalResponse, Self::Gossip];

    const fn index(self) -> usize {
        match self {
            Self::RequestResponse => 0,
            Self::InternalResponse => 1,
            Self::Gossip => 2,
        }
    }

    /// Workers backing this stage's queue.
    const fn worker_count(self) -> usize {
        match self {
            Self::RequestResponse => 4,
            Self::InternalResponse => 2,
            Self::Gossip => 1,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::RequestResponse => "request-response",
            Self::InternalResponse => "internal-response",
            Self::Gossip => "gossip",
        }
    }
}

/// Unit of work handed to a stage.
pub type StageTask = Box<dyn FnOnce() + Send + 'static>;

struct StageExecutor {
    stage: Stage,
    queues: Vec<mpsc::UnboundedSender<StageTask>>,
    next: AtomicUsize,
}

impl StageExecutor {
    fn start(stage: Stage, workers: &mut Vec<JoinHandle<()>>) -> Self {
        let mut queues = Vec::with_capacity(stage.worker_count());
        for worker in 0..stage.worker_count() {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            workers.push(tokio::spawn(run_worker(stage, worker, rx)));
        }
        Self {
            stage,
            queues,
            next: AtomicUsize::new(0),
        }
    }

    fn submit(&self, task: StageTask) {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        if self.queues[slot].send(task).is_err() {
            trace!(stage = self.stage.label(), "task submitted after shutdown");
        }
    }
}

async fn run_worker(stage: Stage, worker: usize, mut rx: mpsc::UnboundedReceiver<StageTask>) {
    while let Some(task) = rx.recv().await {
        // A panicking handler must not poison the worker.
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(stage = stage.label(), worker, "verb handler panicked");
        }
    }
}

/// Owns every stage executor for the lifetime of the messaging service.
pub struct StageManager {
    executors: [StageExecutor; 3],
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StageManager {
    /// Starts all stage worker pools. Must run inside a tokio runtime.
    #[must_use]
    pub fn start() -> Self {
        let mut workers = Vec::new();
        let executors = Stage::ALL.map(|stage| StageExecutor::start(stage, &mut workers));
        Self {
            executors,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues `task` on the given stage.
    pub fn submit(&self, stage: Stage, task: StageTask) {
        self.executors[stage.index()].submit(task);
    }

    /// Stops every worker; queued tasks are abandoned.
    pub fn shutdown(&self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}
