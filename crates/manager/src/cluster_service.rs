//! Single-writer cluster service
//!
//! Every change to the cluster state is an update task pushed onto one channel. A single
//! consumer runs the tasks in submission order against the current state; a task that
//! returns a new version is persisted, published and announced to the watchers.

use allocation::AllocationError;
use cluster_core::{ClusterState, CoreError};
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::storage::{FileStorage, StorageError};
use crate::watch::ClusterStateWatcher;

/// Cluster service error
#[derive(Debug, thiserror::Error)]
pub enum ClusterServiceError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Failed to persist cluster state: {0}")]
    Storage(#[from] StorageError),
    #[error("Update task [{task}] panicked: {message}")]
    TaskPanicked { task: String, message: String },
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Cluster service is closed")]
    Closed,
}

pub type UpdateResult = Result<ClusterState, ClusterServiceError>;

/// Computes the next state from the current one; returning the input means "no change"
pub type UpdateTask = Box<dyn FnOnce(&ClusterState) -> UpdateResult + Send>;

struct Envelope {
    source: String,
    task: UpdateTask,
    reply: oneshot::Sender<Result<Arc<ClusterState>, ClusterServiceError>>,
}

/// Handle to the cluster service; cheap to clone
#[derive(Clone)]
pub struct ClusterService {
    state: Arc<RwLock<Arc<ClusterState>>>,
    sender: mpsc::UnboundedSender<Envelope>,
    watcher: ClusterStateWatcher,
}

impl ClusterService {
    /// Publish `initial` and spawn the consumer task
    pub fn start(initial: ClusterState, storage: Arc<FileStorage>) -> (Self, JoinHandle<()>) {
        let state = Arc::new(RwLock::new(Arc::new(initial)));
        let watcher = ClusterStateWatcher::new();
        let (sender, receiver) = mpsc::unbounded_channel();

        let applier = Applier {
            state: state.clone(),
            watcher: watcher.clone(),
            storage,
        };
        let handle = tokio::spawn(applier.run(receiver));

        (
            Self {
                state,
                sender,
                watcher,
            },
            handle,
        )
    }

    /// Currently published state
    pub fn state(&self) -> Arc<ClusterState> {
        self.state.read().clone()
    }

    pub fn watcher(&self) -> &ClusterStateWatcher {
        &self.watcher
    }

    /// Queue an update task and wait for its outcome
    ///
    /// Resolves to the state published after the task ran; an error leaves the published
    /// state untouched.
    pub async fn submit<F>(&self, source: impl Into<String>, task: F) -> Result<Arc<ClusterState>, ClusterServiceError>
    where
        F: FnOnce(&ClusterState) -> UpdateResult + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let envelope = Envelope {
            source: source.into(),
            task: Box::new(task),
            reply,
        };
        self.sender
            .send(envelope)
            .map_err(|_| ClusterServiceError::Closed)?;
        receiver.await.map_err(|_| ClusterServiceError::Closed)?
    }

    /// Wait until a state newer than `known_version` is published, or the timeout expires
    ///
    /// Returns the published state either way.
    pub async fn wait_for_change(&self, known_version: u64, timeout: Duration) -> Arc<ClusterState> {
        let notify = self.watcher.watch(known_version);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let current = self.state();
        if current.version > known_version {
            return current;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.state()
    }
}

/// The consumer side: owns publication
struct Applier {
    state: Arc<RwLock<Arc<ClusterState>>>,
    watcher: ClusterStateWatcher,
    storage: Arc<FileStorage>,
}

impl Applier {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(Envelope { source, task, reply }) = receiver.recv().await {
            let current = self.state.read().clone();
            let outcome = match run_task(&source, task, &current) {
                Ok(next) if next.version == current.version => {
                    debug!("Update task [{}] left cluster state unchanged", source);
                    Ok(current)
                }
                Ok(next) => self.publish(&source, &current, next).await,
                Err(e) => {
                    warn!("Update task [{}] failed: {}", source, e);
                    Err(e)
                }
            };
            // the submitter may have stopped waiting
            let _ = reply.send(outcome);
        }
        info!("Cluster service stopped");
    }

    async fn publish(
        &self,
        source: &str,
        current: &ClusterState,
        next: ClusterState,
    ) -> Result<Arc<ClusterState>, ClusterServiceError> {
        if next.metadata != current.metadata {
            if let Err(e) = self.storage.save(&next.metadata).await {
                error!(
                    "Failed to persist cluster state version {} from [{}]: {}",
                    next.version, source, e
                );
                return Err(e.into());
            }
        }

        let next = Arc::new(next);
        *self.state.write() = next.clone();
        self.watcher.notify_version(next.version);
        info!(
            "Published cluster state version {} [{}] from [{}]",
            next.version, next.state_uuid, source
        );
        Ok(next)
    }
}

fn run_task(source: &str, task: UpdateTask, current: &ClusterState) -> UpdateResult {
    match panic::catch_unwind(AssertUnwindSafe(|| task(current))) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!("Update task [{}] panicked: {}", source, message);
            Err(ClusterServiceError::TaskPanicked {
                task: source.to_string(),
                message,
            })
        }
    }
}
