//! Where load workers run and where their results are delivered

use parking_lot::Mutex;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::error::{Error, Result};
use crate::worker::{Completion, LoadWorker};

/// Executes load workers
pub trait TaskStrategy: Send + Sync {
    /// Start `worker` off the calling thread
    fn submit(&self, worker: LoadWorker);

    /// Runtime used for workers and background lifecycle jobs
    fn runtime(&self) -> &RuntimeHandle;

    /// Deliver finished loads queued for the caller's thread
    ///
    /// # Returns
    /// * Number of completions processed
    fn run_pending(&self) -> usize {
        0
    }
}

fn current_runtime() -> Result<RuntimeHandle> {
    RuntimeHandle::try_current()
        .map_err(|e| Error::Configuration(format!("no tokio runtime: {}", e)))
}

/// Runs workers on the tokio blocking pool and delivers from the worker thread
#[derive(Debug, Clone)]
pub struct ThreadPoolStrategy {
    runtime: RuntimeHandle,
}

impl ThreadPoolStrategy {
    /// Use the blocking pool of `runtime`
    pub fn new(runtime: RuntimeHandle) -> Self {
        Self { runtime }
    }

    /// Use the runtime of the calling context
    pub fn current() -> Result<Self> {
        Ok(Self::new(current_runtime()?))
    }
}

impl TaskStrategy for ThreadPoolStrategy {
    fn submit(&self, worker: LoadWorker) {
        self.runtime.spawn_blocking(move || {
            let outcome = worker.run().finish();
            trace!(?outcome, "worker finished");
        });
    }

    fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }
}

/// Runs workers on the tokio blocking pool and queues results until the
/// caller drains them with [`TaskStrategy::run_pending`]
pub struct CallerThreadStrategy {
    runtime: RuntimeHandle,
    sender: UnboundedSender<Completion>,
    receiver: Mutex<UnboundedReceiver<Completion>>,
}

impl CallerThreadStrategy {
    /// Use the blocking pool of `runtime`
    pub fn new(runtime: RuntimeHandle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            runtime,
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Use the runtime of the calling context
    pub fn current() -> Result<Self> {
        Ok(Self::new(current_runtime()?))
    }
}

impl TaskStrategy for CallerThreadStrategy {
    fn submit(&self, worker: LoadWorker) {
        let sender = self.sender.clone();
        self.runtime.spawn_blocking(move || {
            // A closed queue drops the completion, closing its image
            let _ = sender.send(worker.run());
        });
    }

    fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    fn run_pending(&self) -> usize {
        let pending: Vec<Completion> = {
            let mut receiver = self.receiver.lock();
            std::iter::from_fn(|| receiver.try_recv().ok()).collect()
        };
        let count = pending.len();
        // Targets may start new loads from their callbacks
        for completion in pending {
            let outcome = completion.finish();
            trace!(?outcome, "completion delivered");
        }
        count
    }
}
