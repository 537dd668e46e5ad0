//! Background task manager: a fixed pool of worker threads, each driving its own
//! single-threaded tokio runtime, fed from one flume queue.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::streaming::CancelFlag;

const MAX_LOG_LINES: usize = 200;
/// How long finished records stay listable before they are dropped.
const FINISHED_RETENTION: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub owner_user_id: i64,
    pub status: TaskStatus,
    pub progress: u8,
    pub logs: Vec<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Receives every record change; used to push `task_update` payloads to the owner.
pub type TaskObserver = Arc<dyn Fn(&TaskRecord) + Send + Sync>;

/// A unit of background work.
#[async_trait]
pub trait TaskJob: Send {
    async fn run(self: Box<Self>, handle: TaskHandle) -> Result<Value>;
}

struct QueuedTask {
    id: String,
    job: Box<dyn TaskJob>,
}

#[derive(Default)]
struct TaskState {
    records: Mutex<HashMap<String, TaskRecord>>,
    cancel_flags: Mutex<HashMap<String, CancelFlag>>,
    observer: RwLock<Option<TaskObserver>>,
}

impl TaskState {
    /// Applies `change` to the record and notifies the observer outside the lock.
    fn update(&self, id: &str, change: impl FnOnce(&mut TaskRecord)) -> Option<TaskRecord> {
        let snapshot = {
            let mut records = match self.records.lock() {
                Ok(records) => records,
                Err(poisoned) => poisoned.into_inner(),
            };
            let record = records.get_mut(id)?;
            change(record);
            record.updated_at = Utc::now();
            record.clone()
        };
        self.notify(&snapshot);
        Some(snapshot)
    }

    fn notify(&self, record: &TaskRecord) {
        let observer = match self.observer.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(observer) = observer {
            observer(record);
        }
    }

    fn cancel_flag(&self, id: &str) -> Option<CancelFlag> {
        self.cancel_flags.lock().ok()?.get(id).cloned()
    }

    fn drop_cancel_flag(&self, id: &str) {
        if let Ok(mut flags) = self.cancel_flags.lock() {
            flags.remove(id);
        }
    }
}

/// Given to a running job for progress reporting and cooperative cancellation.
#[derive(Clone)]
pub struct TaskHandle {
    id: String,
    state: Arc<TaskState>,
    cancel: CancelFlag,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_progress(&self, progress: u8) {
        self.state.update(&self.id, |record| {
            record.progress = progress.min(100);
        });
    }

    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!("task {}: {}", self.id, line);
        self.state.update(&self.id, |record| {
            record.logs.push(line);
            if record.logs.len() > MAX_LOG_LINES {
                let excess = record.logs.len() - MAX_LOG_LINES;
                record.logs.drain(..excess);
            }
        });
    }
}

pub struct TaskManager {
    state: Arc<TaskState>,
    queue: flume::Sender<QueuedTask>,
    retention: Duration,
    _workers: Vec<JoinHandle<()>>,
}

impl TaskManager {
    pub fn new(worker_count: usize) -> Self {
        Self::with_retention(worker_count, FINISHED_RETENTION)
    }

    /// Finished records older than `retention` are evicted on the next create or listing.
    pub fn with_retention(worker_count: usize, retention: Duration) -> Self {
        let state = Arc::new(TaskState::default());
        let (queue, rx) = flume::unbounded::<QueuedTask>();
        let workers = (0..worker_count.max(1))
            .filter_map(|index| {
                let rx = rx.clone();
                let state = state.clone();
                std::thread::Builder::new()
                    .name(format!("task-worker-{}", index))
                    .spawn(move || worker_loop(rx, state))
                    .map_err(|e| tracing::error!("Failed to spawn task worker {}: {}", index, e))
                    .ok()
            })
            .collect();
        Self {
            state,
            queue,
            retention,
            _workers: workers,
        }
    }

    pub fn set_observer(&self, observer: TaskObserver) {
        match self.state.observer.write() {
            Ok(mut guard) => *guard = Some(observer),
            Err(poisoned) => *poisoned.into_inner() = Some(observer),
        }
    }

    /// Queues `job` and returns its task id.
    pub fn submit(&self, name: &str, owner_user_id: i64, job: Box<dyn TaskJob>) -> Result<String> {
        let id = self.create(name, owner_user_id)?;
        self.enqueue(&id, job)?;
        Ok(id)
    }

    /// Registers a pending task without starting it, so its id can be persisted before
    /// the job gets a chance to touch the same records.
    pub fn create(&self, name: &str, owner_user_id: i64) -> Result<String> {
        self.evict_finished();
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = TaskRecord {
            id: id.clone(),
            name: name.to_string(),
            owner_user_id,
            status: TaskStatus::Pending,
            progress: 0,
            logs: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.state
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Task table lock poisoned"))?
            .insert(id.clone(), record.clone());
        self.state
            .cancel_flags
            .lock()
            .map_err(|_| anyhow::anyhow!("Task flag lock poisoned"))?
            .insert(id.clone(), CancelFlag::new());
        self.state.notify(&record);
        Ok(id)
    }

    pub fn enqueue(&self, id: &str, job: Box<dyn TaskJob>) -> Result<()> {
        let Some(record) = self.get(id) else {
            anyhow::bail!("Unknown task {}", id);
        };
        let queued = QueuedTask {
            id: id.to_string(),
            job,
        };
        if self.queue.send(queued).is_err() {
            self.state.update(id, |r| {
                r.status = TaskStatus::Failed;
                r.error = Some("Task workers are not running".to_string());
            });
            self.state.drop_cancel_flag(id);
            anyhow::bail!("Task workers are not running");
        }
        tracing::info!(
            "Queued task {} ({}) for user {}",
            id,
            record.name,
            record.owner_user_id
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.state.records.lock().ok()?.get(id).cloned()
    }

    pub fn list_for_user(&self, owner_user_id: i64) -> Vec<TaskRecord> {
        self.evict_finished();
        let Ok(records) = self.state.records.lock() else {
            return Vec::new();
        };
        let mut list: Vec<TaskRecord> = records
            .values()
            .filter(|r| r.owner_user_id == owner_user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Marks a task that was created but never queued as failed.
    pub fn fail_unstarted(&self, id: &str, reason: &str) {
        if self.get(id).map(|r| r.status) != Some(TaskStatus::Pending) {
            return;
        }
        let updated = self.state.update(id, |record| {
            record.status = TaskStatus::Failed;
            record.error = Some(reason.to_string());
        });
        if updated.is_some() {
            self.state.drop_cancel_flag(id);
            tracing::warn!("Task {} abandoned: {}", id, reason);
        }
    }

    fn evict_finished(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let now = Utc::now();
        let Ok(mut records) = self.state.records.lock() else {
            return;
        };
        let before = records.len();
        records.retain(|_, r| !r.status.is_terminal() || now - r.updated_at < retention);
        let evicted = before - records.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} finished task records", evicted);
        }
    }

    /// Requests cancellation. Pending tasks never start; running ones stop at their
    /// next checkpoint. Returns `false` for unknown or finished tasks.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(record) = self.get(id) else {
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }
        match self.state.cancel_flag(id) {
            Some(flag) => {
                flag.cancel();
                tracing::info!("Cancellation requested for task {}", id);
                true
            }
            None => false,
        }
    }
}

fn worker_loop(rx: flume::Receiver<QueuedTask>, state: Arc<TaskState>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Task worker runtime failed to start: {}", e);
            return;
        }
    };

    while let Ok(QueuedTask { id, job }) = rx.recv() {
        let cancel = state.cancel_flag(&id).unwrap_or_default();
        if cancel.is_cancelled() {
            state.update(&id, |r| r.status = TaskStatus::Cancelled);
            state.drop_cancel_flag(&id);
            continue;
        }
        state.update(&id, |r| r.status = TaskStatus::Running);

        let handle = TaskHandle {
            id: id.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
        };
        let outcome = rt.block_on(job.run(handle));

        state.update(&id, |record| match outcome {
            _ if cancel.is_cancelled() => record.status = TaskStatus::Cancelled,
            Ok(result) => {
                record.status = TaskStatus::Completed;
                record.progress = 100;
                record.result = Some(result);
            }
            Err(e) => {
                tracing::warn!("Task {} failed: {:#}", record.id, e);
                record.status = TaskStatus::Failed;
                record.error = Some(format!("{:#}", e));
            }
        });
        state.drop_cancel_flag(&id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Polls until the task reaches a terminal state.
    pub(crate) fn wait_for_terminal(manager: &TaskManager, id: &str) -> TaskRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(record) = manager.get(id) {
                if record.status.is_terminal() {
                    return record;
                }
            }
            assert!(Instant::now() < deadline, "task {} did not finish", id);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    struct CountingJob;

    #[async_trait]
    impl TaskJob for CountingJob {
        async fn run(self: Box<Self>, handle: TaskHandle) -> Result<Value> {
            for step in 1..=4u8 {
                handle.set_progress(step * 25);
                handle.log(format!("step {}", step));
            }
            Ok(serde_json::json!({"steps": 4}))
        }
    }

    struct FailingJob;

    #[async_trait]
    impl TaskJob for FailingJob {
        async fn run(self: Box<Self>, _handle: TaskHandle) -> Result<Value> {
            anyhow::bail!("nothing to do")
        }
    }

    /// Blocks until released, so later tasks stay pending.
    struct GatedJob(flume::Receiver<()>);

    #[async_trait]
    impl TaskJob for GatedJob {
        async fn run(self: Box<Self>, handle: TaskHandle) -> Result<Value> {
            let _ = self.0.recv_async().await;
            if handle.is_cancelled() {
                anyhow::bail!("stopped");
            }
            Ok(Value::Null)
        }
    }

    #[test]
    fn jobs_report_progress_and_results_to_the_observer() {
        let manager = TaskManager::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.set_observer(Arc::new(move |record: &TaskRecord| {
            sink.lock().unwrap().push((record.status, record.progress));
        }));

        let id = manager.submit("count", 7, Box::new(CountingJob)).unwrap();
        let record = wait_for_terminal(&manager, &id);
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.logs.len(), 4);
        assert_eq!(record.result, Some(serde_json::json!({"steps": 4})));
        assert_eq!(manager.list_for_user(7).len(), 1);
        assert!(manager.list_for_user(8).is_empty());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&(TaskStatus::Pending, 0)));
        assert!(seen.contains(&(TaskStatus::Running, 50)));
        assert_eq!(seen.last(), Some(&(TaskStatus::Completed, 100)));
    }

    #[test]
    fn failures_are_recorded() {
        let manager = TaskManager::new(1);
        let id = manager.submit("fail", 1, Box::new(FailingJob)).unwrap();
        let record = wait_for_terminal(&manager, &id);
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("nothing to do"));
        assert!(!manager.cancel(&id));
    }

    #[test]
    fn cancellation_covers_pending_and_running_tasks() {
        let manager = TaskManager::new(1);
        let (release, gate) = flume::unbounded();
        let running = manager.submit("gate", 1, Box::new(GatedJob(gate))).unwrap();
        let pending = manager.submit("count", 1, Box::new(CountingJob)).unwrap();

        assert!(manager.cancel(&pending));
        assert!(manager.cancel(&running));
        release.send(()).unwrap();

        assert_eq!(wait_for_terminal(&manager, &running).status, TaskStatus::Cancelled);
        let pending = wait_for_terminal(&manager, &pending);
        assert_eq!(pending.status, TaskStatus::Cancelled);
        assert!(pending.logs.is_empty());
        assert!(!manager.cancel("unknown"));
    }

    #[test]
    fn finished_records_are_evicted_after_retention() {
        let manager = TaskManager::with_retention(1, Duration::ZERO);
        let (release, gate) = flume::unbounded();
        let done = manager.submit("count", 3, Box::new(CountingJob)).unwrap();
        wait_for_terminal(&manager, &done);
        let busy = manager.submit("gate", 3, Box::new(GatedJob(gate))).unwrap();

        let ids: Vec<String> = manager.list_for_user(3).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![busy.clone()]);
        assert!(manager.get(&done).is_none());

        release.send(()).unwrap();
        wait_for_terminal(&manager, &busy);
        assert!(manager.list_for_user(3).is_empty());

        let kept = TaskManager::new(1);
        let id = kept.submit("count", 3, Box::new(CountingJob)).unwrap();
        wait_for_terminal(&kept, &id);
        assert_eq!(kept.list_for_user(3).len(), 1);
    }

    #[test]
    fn unstarted_tasks_can_be_failed() {
        let manager = TaskManager::new(1);
        let id = manager.create("slideshow", 2).unwrap();
        manager.fail_unstarted(&id, "reply was not saved");

        let record = manager.get(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("reply was not saved"));
        assert!(!manager.cancel(&id));

        let done = manager.submit("count", 2, Box::new(CountingJob)).unwrap();
        wait_for_terminal(&manager, &done);
        manager.fail_unstarted(&done, "late");
        assert_eq!(manager.get(&done).unwrap().status, TaskStatus::Completed);
    }
}
