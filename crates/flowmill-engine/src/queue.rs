//! Bounded work queue feeding the worker pool.
//!
//! Walk continuations never run on the caller's task: API calls persist
//! their state change, enqueue a `WorkItem`, and return. Producers await
//! when the queue is full.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use flowmill_core::error::{FlowError, Result};

/// What a worker should do for an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkStep {
    /// Execute the node itself.
    Enter(String),
    /// Walk the successors of an already executed node.
    After(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub instance_id: String,
    pub step: WorkStep,
}

impl WorkItem {
    pub fn enter(instance_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            step: WorkStep::Enter(node_id.into()),
        }
    }

    pub fn after(instance_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            step: WorkStep::After(node_id.into()),
        }
    }

    pub fn node_id(&self) -> &str {
        match &self.step {
            WorkStep::Enter(id) | WorkStep::After(id) => id,
        }
    }
}

#[derive(Default)]
struct Tracker {
    /// Items queued or being processed.
    pending: AtomicUsize,
    idle: Notify,
}

/// Producer side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    tracker: Arc<Tracker>,
}

/// Consumer side, shared by every worker.
#[derive(Clone)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    tracker: Arc<Tracker>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> (Self, WorkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let tracker = Arc::new(Tracker::default());
        (
            Self {
                tx,
                tracker: tracker.clone(),
            },
            WorkReceiver {
                rx: Arc::new(Mutex::new(rx)),
                tracker,
            },
        )
    }

    /// Queue an item, waiting for capacity if the queue is full.
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| FlowError::EngineFault("work queue is closed".into()))?;
        self.tracker.pending.fetch_add(1, Ordering::SeqCst);
        permit.send(item);
        Ok(())
    }

    /// Items queued or in flight.
    pub fn pending(&self) -> usize {
        self.tracker.pending.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.tracker.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl WorkReceiver {
    /// Next item, or `None` once every producer is gone.
    pub async fn recv(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }

    /// Mark one received item as fully processed.
    pub fn done(&self) {
        self.tracker.finish_one();
    }

    /// Marks the item processed when dropped, including during a panic.
    pub fn done_on_drop(&self) -> DoneGuard {
        DoneGuard {
            tracker: self.tracker.clone(),
        }
    }
}

pub struct DoneGuard {
    tracker: Arc<Tracker>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.tracker.finish_one();
    }
}

impl Tracker {
    fn finish_one(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::SeqCst);
        if prev <= 1 {
            self.idle.notify_waiters();
        }
    }
}
