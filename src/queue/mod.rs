//! Durable queue of mutations attempted while offline.
//!
//! Operations are appended to an ordered list persisted under a single
//! store key and replayed oldest-first by [`PendingOperationQueue::drain`]
//! once connectivity returns.

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::storage::KeyValueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Store key holding the persisted operation list.
pub const QUEUE_KEY: &str = "pending_operations";

/// A mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique, time-ordered id assigned at insertion.
    pub id: String,
    /// Kind of mutation (e.g. "place_order").
    #[serde(rename = "type")]
    pub op_type: String,
    /// Opaque request body for the executor.
    pub payload: serde_json::Value,
    /// When the operation was queued.
    pub created_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

/// Performs a queued mutation against the remote service.
///
/// Supplied by the host application. `Ok` means the remote side confirmed
/// the mutation and the operation can be forgotten.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &PendingOperation) -> Result<()>;
}

/// What a single drain pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Ids executed and removed.
    pub succeeded: Vec<String>,
    /// Ids that failed and remain queued.
    pub failed: Vec<String>,
    /// Operations removed after reaching the attempt cap.
    pub dropped: Vec<PendingOperation>,
}

impl DrainReport {
    /// Whether the pass touched no operations.
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.dropped.is_empty()
    }
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// The pass ran to the end of the queue.
    Completed(DrainReport),
    /// Another drain was in progress; nothing was executed.
    AlreadyRunning,
}

/// Clears the in-progress flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable FIFO of [`PendingOperation`]s.
pub struct PendingOperationQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: QueueConfig,
    operations: Mutex<Vec<PendingOperation>>,
    draining: AtomicBool,
}

impl fmt::Debug for PendingOperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperationQueue")
            .field("policy", &self.policy)
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PendingOperationQueue {
    /// Create an empty queue. Call [`load`](Self::load) to pick up operations
    /// persisted by a previous run.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, policy: QueueConfig) -> Self {
        Self {
            store,
            clock,
            policy,
            operations: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Replace the in-memory list with the persisted one.
    ///
    /// Unreadable or corrupt data is logged and yields an empty queue.
    /// Returns the number of operations loaded.
    pub async fn load(&self) -> usize {
        let loaded = match self.store.get(QUEUE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<PendingOperation>>(&bytes) {
                Ok(ops) => ops,
                Err(e) => {
                    error!(error = %e, "Persisted pending operations are corrupt, starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Could not read pending operations, starting empty");
                Vec::new()
            }
        };

        let count = loaded.len();
        *self.operations.lock().await = loaded;
        info!(count, "Pending operations loaded");
        count
    }

    async fn persist(&self, operations: &[PendingOperation]) -> Result<()> {
        let bytes = serde_json::to_vec(operations)?;
        self.store.set(QUEUE_KEY, bytes).await
    }

    /// Append an operation and persist the queue. Returns the new id.
    ///
    /// If persisting fails the operation is not kept and the error is
    /// returned, since it would not survive a restart.
    pub async fn enqueue(
        &self,
        op_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<String> {
        let operation = PendingOperation {
            id: Uuid::now_v7().to_string(),
            op_type: op_type.into(),
            payload,
            created_at: self.clock.now(),
            attempts: 0,
        };
        let id = operation.id.clone();

        let mut operations = self.operations.lock().await;
        operations.push(operation);
        if let Err(e) = self.persist(&operations).await {
            operations.pop();
            return Err(e);
        }

        debug!(id, pending = operations.len(), "Operation queued");
        Ok(id)
    }

    /// Queued operations, oldest first.
    pub async fn list(&self) -> Vec<PendingOperation> {
        self.operations.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.operations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.operations.lock().await.is_empty()
    }

    /// Whether a drain pass is currently running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Delete an operation by id. Returns whether it was present.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut operations = self.operations.lock().await;
        let Some(index) = operations.iter().position(|op| op.id == id) else {
            return Ok(false);
        };
        operations.remove(index);
        self.persist(&operations).await?;
        Ok(true)
    }

    /// Record a failed replay. Returns the operation if it reached the
    /// attempt cap and was removed.
    async fn record_failure(&self, id: &str) -> Result<Option<PendingOperation>> {
        let mut operations = self.operations.lock().await;
        let Some(index) = operations.iter().position(|op| op.id == id) else {
            return Ok(None);
        };

        operations[index].attempts += 1;
        let attempts = operations[index].attempts;
        let dropped = match self.policy.max_attempts {
            Some(max) if attempts >= max => Some(operations.remove(index)),
            _ => None,
        };
        self.persist(&operations).await?;
        Ok(dropped)
    }

    /// Replay every queued operation once, oldest first.
    ///
    /// Successful operations are removed. Failed ones stay queued for the
    /// next drain (unless the attempt cap removes them); a failure does not
    /// stop the pass. Operations enqueued during the pass wait for the next
    /// one. Only one drain runs at a time.
    pub async fn drain(&self, executor: &dyn OperationExecutor) -> DrainOutcome {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("Drain already in progress");
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot = self.operations.lock().await.clone();
        let mut report = DrainReport::default();
        if snapshot.is_empty() {
            return DrainOutcome::Completed(report);
        }

        info!(pending = snapshot.len(), "Replaying pending operations");
        for operation in snapshot {
            match executor.execute(&operation).await {
                Ok(()) => {
                    if let Err(e) = self.remove(&operation.id).await {
                        error!(id = %operation.id, error = %e, "Replayed operation could not be removed from storage");
                    }
                    report.succeeded.push(operation.id);
                }
                Err(e) => {
                    warn!(id = %operation.id, op_type = %operation.op_type, error = %e, "Replay failed");
                    match self.record_failure(&operation.id).await {
                        Ok(Some(dropped)) => {
                            warn!(id = %dropped.id, attempts = dropped.attempts, "Operation dropped after reaching attempt cap");
                            report.dropped.push(dropped);
                        }
                        Ok(None) => report.failed.push(operation.id),
                        Err(e) => {
                            error!(id = %operation.id, error = %e, "Could not persist replay failure");
                            report.failed.push(operation.id);
                        }
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            dropped = report.dropped.len(),
            "Drain finished"
        );
        DrainOutcome::Completed(report)
    }
}
