//! In-memory task store: bounded queue, per-task cancellation, TTL
//! eviction of finished work, and approval-driven re-enqueue of paused
//! tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use conductor_core::error::InfraError;
use conductor_core::task::{TaskInfo, TaskStatus};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(30 * 60);

const EVICT_INTERVAL: Duration = Duration::from_secs(60);

struct QueuedTask {
    info: TaskInfo,
    cancel: CancellationToken,
    deadline: Instant,
    /// Set when the task is re-queued to resume a paused run.
    resume_approval_id: Option<String>,
}

/// What the worker receives for one unit of work.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: String,
    pub task: String,
    pub model: String,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub resume_approval_id: Option<String>,
}

struct Inner {
    tasks: RwLock<HashMap<String, QueuedTask>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: AsyncMutex<mpsc::Receiver<String>>,
    done: CancellationToken,
    default_model: String,
    default_timeout: Duration,
    completed_ttl: Duration,
}

#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Inner>,
}

impl TaskStore {
    pub fn new(
        queue_capacity: usize,
        default_model: impl Into<String>,
        default_timeout: Duration,
        completed_ttl: Duration,
    ) -> Self {
        let capacity = if queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            queue_capacity
        };
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let store = Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(HashMap::new()),
                queue_tx,
                queue_rx: AsyncMutex::new(queue_rx),
                done: CancellationToken::new(),
                default_model: default_model.into(),
                default_timeout: if default_timeout.is_zero() {
                    DEFAULT_TASK_TIMEOUT
                } else {
                    default_timeout
                },
                completed_ttl: if completed_ttl.is_zero() {
                    DEFAULT_COMPLETED_TTL
                } else {
                    completed_ttl
                },
            }),
        };
        store.spawn_evict_loop();
        store
    }

    /// Accept a task into the queue. The child cancellation token is
    /// derived from the store's root token, so `close()` cancels every
    /// in-flight task. A full queue rejects the task and releases the
    /// token it just created.
    pub fn enqueue(
        &self,
        task: impl Into<String>,
        model: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<TaskInfo, InfraError> {
        if self.inner.done.is_cancelled() {
            return Err(InfraError::StoreClosed);
        }

        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.inner.default_timeout);
        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.inner.default_model.clone());

        let id = new_task_id();
        let info = TaskInfo {
            id: id.clone(),
            status: TaskStatus::Queued,
            task: task.into(),
            model,
            timeout_secs: timeout.as_secs(),
            created_at: Utc::now(),
            started_at: None,
            pending_at: None,
            resumed_at: None,
            finished_at: None,
            approval_request_id: None,
            error: None,
            result: None,
        };
        let entry = QueuedTask {
            info: info.clone(),
            cancel: self.inner.done.child_token(),
            deadline: Instant::now() + timeout,
            resume_approval_id: None,
        };

        {
            let mut tasks = self.inner.tasks.write().expect("tasks lock");
            tasks.insert(id.clone(), entry);
        }

        if let Err(err) = self.inner.queue_tx.try_send(id.clone()) {
            let mut tasks = self.inner.tasks.write().expect("tasks lock");
            if let Some(entry) = tasks.remove(&id) {
                entry.cancel.cancel();
            }
            return match err {
                mpsc::error::TrySendError::Full(_) => Err(InfraError::QueueFull),
                mpsc::error::TrySendError::Closed(_) => Err(InfraError::StoreClosed),
            };
        }
        Ok(info)
    }

    /// Block until a task is available. Returns `None` once the store is
    /// closed.
    pub async fn next(&self) -> Option<Dispatch> {
        loop {
            let id = {
                let mut rx = self.inner.queue_rx.lock().await;
                tokio::select! {
                    _ = self.inner.done.cancelled() => return None,
                    id = rx.recv() => id?,
                }
            };
            // The entry can be gone if the task was failed or evicted
            // while queued; skip and keep draining.
            if let Some(dispatch) = self.take_dispatch(&id) {
                return Some(dispatch);
            }
        }
    }

    fn take_dispatch(&self, id: &str) -> Option<Dispatch> {
        let mut tasks = self.inner.tasks.write().expect("tasks lock");
        let entry = tasks.get_mut(id)?;
        Some(Dispatch {
            id: entry.info.id.clone(),
            task: entry.info.task.clone(),
            model: entry.info.model.clone(),
            cancel: entry.cancel.clone(),
            deadline: entry.deadline,
            resume_approval_id: entry.resume_approval_id.take(),
        })
    }

    /// Snapshot of a task for external readers.
    pub fn get(&self, id: &str) -> Option<TaskInfo> {
        let tasks = self.inner.tasks.read().expect("tasks lock");
        tasks.get(id).map(|entry| entry.info.clone())
    }

    /// Single-writer mutation under the lock.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut TaskInfo)) {
        let mut tasks = self.inner.tasks.write().expect("tasks lock");
        if let Some(entry) = tasks.get_mut(id) {
            mutate(&mut entry.info);
        }
    }

    /// Shut the store down: one-shot, idempotent. Cancelling the root
    /// token cancels every derived task token and unblocks `next()`.
    pub fn close(&self) {
        self.inner.done.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Push the pending task bound to this approval back onto the queue
    /// for resumption. Refuses when no pending task matches, when it is
    /// already queued for resume, or when the queue is full (the marker
    /// is rolled back in that case).
    pub fn enqueue_resume_by_approval_id(&self, approval_id: &str) -> Result<String, InfraError> {
        let approval_id = approval_id.trim();
        if approval_id.is_empty() {
            return Err(InfraError::Config("missing approval_request_id".to_string()));
        }

        let task_id = {
            let mut tasks = self.inner.tasks.write().expect("tasks lock");
            let entry = tasks
                .values_mut()
                .find(|entry| {
                    entry.info.status == TaskStatus::Pending
                        && entry.info.approval_request_id.as_deref() == Some(approval_id)
                })
                .ok_or_else(|| {
                    InfraError::Config(format!(
                        "no pending task found for approval_request_id '{approval_id}'"
                    ))
                })?;
            if entry.resume_approval_id.is_some() {
                return Err(InfraError::Config(
                    "task is already queued for resume".to_string(),
                ));
            }
            entry.resume_approval_id = Some(approval_id.to_string());
            entry.info.id.clone()
        };

        if let Err(err) = self.inner.queue_tx.try_send(task_id.clone()) {
            let mut tasks = self.inner.tasks.write().expect("tasks lock");
            if let Some(entry) = tasks.get_mut(&task_id) {
                entry.resume_approval_id = None;
            }
            return match err {
                mpsc::error::TrySendError::Full(_) => Err(InfraError::QueueFull),
                mpsc::error::TrySendError::Closed(_) => Err(InfraError::StoreClosed),
            };
        }
        Ok(task_id)
    }

    /// Fail the pending task bound to this approval: terminal `failed`
    /// status, finished stamp, and cancellation of its context.
    pub fn fail_pending_by_approval_id(
        &self,
        approval_id: &str,
        error: &str,
    ) -> Option<String> {
        let approval_id = approval_id.trim();
        if approval_id.is_empty() {
            return None;
        }

        let (task_id, cancel) = {
            let mut tasks = self.inner.tasks.write().expect("tasks lock");
            let entry = tasks.values_mut().find(|entry| {
                entry.info.status == TaskStatus::Pending
                    && entry.info.approval_request_id.as_deref() == Some(approval_id)
            })?;
            entry.info.status = TaskStatus::Failed;
            entry.info.error = Some(error.trim().to_string());
            entry.info.finished_at = Some(Utc::now());
            (entry.info.id.clone(), entry.cancel.clone())
        };
        cancel.cancel();
        Some(task_id)
    }

    fn spawn_evict_loop(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICT_INTERVAL);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = store.inner.done.cancelled() => return,
                    _ = ticker.tick() => store.evict_expired(),
                }
            }
        });
    }

    /// Drop terminal tasks whose finished stamp is older than the TTL.
    /// Queued, running and pending entries are never evicted.
    fn evict_expired(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.inner.completed_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));

        let mut tasks = self.inner.tasks.write().expect("tasks lock");
        tasks.retain(|_, entry| {
            if !entry.info.status.is_terminal() {
                return true;
            }
            match entry.info.finished_at {
                Some(finished_at) => now - finished_at <= ttl,
                None => true,
            }
        });
    }

    #[cfg(test)]
    fn evict_now(&self) {
        self.evict_expired();
    }

    #[cfg(test)]
    fn task_count(&self) -> usize {
        self.inner.tasks.read().expect("tasks lock").len()
    }
}

fn new_task_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    conductor_core::policy::hex_lower(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(capacity: usize) -> TaskStore {
        TaskStore::new(
            capacity,
            "test-model",
            Duration::from_secs(60),
            Duration::from_secs(1800),
        )
    }

    #[tokio::test]
    async fn enqueue_and_dispatch_roundtrip() {
        let store = test_store(4);
        let info = store
            .enqueue("summarize the logs", None, None)
            .expect("enqueue");
        assert_eq!(info.status, TaskStatus::Queued);
        assert_eq!(info.model, "test-model");
        assert_eq!(info.timeout_secs, 60);

        let dispatch = store.next().await.expect("dispatch");
        assert_eq!(dispatch.id, info.id);
        assert_eq!(dispatch.task, "summarize the logs");
        assert!(dispatch.resume_approval_id.is_none());
    }

    #[tokio::test]
    async fn queue_full_rejects_and_rolls_back() {
        let store = test_store(1);
        store.enqueue("first", None, None).expect("first fits");
        let err = store.enqueue("second", None, None).expect_err("full");
        assert!(matches!(err, InfraError::QueueFull));
        // The rejected task left no residue in the map.
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unblocks_next() {
        let store = test_store(2);
        let info = store.enqueue("task", None, None).expect("enqueue");
        let cancel = {
            let dispatch = store.next().await.expect("dispatch");
            dispatch.cancel
        };

        store.close();
        store.close();
        assert!(store.is_closed());
        assert!(cancel.is_cancelled(), "child tokens cancel with the root");
        assert!(store.next().await.is_none());
        assert!(matches!(
            store.enqueue("late", None, None),
            Err(InfraError::StoreClosed)
        ));
        // Existing task info stays readable after close.
        assert!(store.get(&info.id).is_some());
    }

    #[tokio::test]
    async fn get_returns_a_snapshot() {
        let store = test_store(2);
        let info = store.enqueue("task", None, None).expect("enqueue");
        let mut snapshot = store.get(&info.id).expect("snapshot");
        snapshot.status = TaskStatus::Failed;
        // Mutating the snapshot must not affect the live entry.
        assert_eq!(store.get(&info.id).expect("live").status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn resume_enqueue_requires_a_matching_pending_task() {
        let store = test_store(4);
        let info = store.enqueue("deploy", None, None).expect("enqueue");
        store.next().await.expect("drain queue");

        let err = store
            .enqueue_resume_by_approval_id("apr_x")
            .expect_err("nothing pending");
        assert!(matches!(err, InfraError::Config(_)));

        store.update(&info.id, |t| {
            t.status = TaskStatus::Pending;
            t.approval_request_id = Some("apr_x".to_string());
        });

        let task_id = store
            .enqueue_resume_by_approval_id("apr_x")
            .expect("resume enqueue");
        assert_eq!(task_id, info.id);

        // A second resume enqueue while queued is refused.
        let err = store
            .enqueue_resume_by_approval_id("apr_x")
            .expect_err("double queue");
        assert!(matches!(err, InfraError::Config(_)));

        let dispatch = store.next().await.expect("dispatch");
        assert_eq!(dispatch.resume_approval_id.as_deref(), Some("apr_x"));
    }

    #[tokio::test]
    async fn resume_enqueue_rolls_back_marker_when_queue_is_full() {
        let store = test_store(1);
        let pending = store.enqueue("deploy", None, None).expect("enqueue");
        store.next().await.expect("drain");
        store.update(&pending.id, |t| {
            t.status = TaskStatus::Pending;
            t.approval_request_id = Some("apr_full".to_string());
        });

        // Fill the queue so the resume push cannot land.
        store.enqueue("filler", None, None).expect("filler");

        let err = store
            .enqueue_resume_by_approval_id("apr_full")
            .expect_err("queue full");
        assert!(matches!(err, InfraError::QueueFull));

        // Marker was cleared, so a later attempt succeeds once there is room.
        store.next().await.expect("drain filler");
        store
            .enqueue_resume_by_approval_id("apr_full")
            .expect("second attempt");
    }

    #[tokio::test]
    async fn fail_pending_by_approval_id_cancels_and_stamps() {
        let store = test_store(4);
        let info = store.enqueue("deploy", None, None).expect("enqueue");
        let dispatch = store.next().await.expect("dispatch");
        store.update(&info.id, |t| {
            t.status = TaskStatus::Pending;
            t.approval_request_id = Some("apr_deny".to_string());
        });

        let task_id = store
            .fail_pending_by_approval_id("apr_deny", "approval denied")
            .expect("fail pending");
        assert_eq!(task_id, info.id);
        assert!(dispatch.cancel.is_cancelled());

        let failed = store.get(&info.id).expect("info");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("approval denied"));
        assert!(failed.finished_at.is_some());

        // Not pending anymore: a second call finds nothing.
        assert!(store
            .fail_pending_by_approval_id("apr_deny", "again")
            .is_none());
    }

    #[tokio::test]
    async fn eviction_drops_only_stale_terminal_tasks() {
        let store = test_store(8);
        let done_old = store.enqueue("old done", None, None).expect("enqueue");
        let done_fresh = store.enqueue("fresh done", None, None).expect("enqueue");
        let pending = store.enqueue("pending", None, None).expect("enqueue");

        store.update(&done_old.id, |t| {
            t.status = TaskStatus::Done;
            t.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        });
        store.update(&done_fresh.id, |t| {
            t.status = TaskStatus::Done;
            t.finished_at = Some(Utc::now());
        });
        store.update(&pending.id, |t| {
            t.status = TaskStatus::Pending;
        });

        store.evict_now();

        assert!(store.get(&done_old.id).is_none(), "stale terminal evicted");
        assert!(store.get(&done_fresh.id).is_some(), "fresh terminal kept");
        assert!(store.get(&pending.id).is_some(), "pending never evicted");
    }
}
