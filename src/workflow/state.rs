//! Execution-State Store & Heartbeat (§4.9).
//!
//! Grounded on `descartes-v2/src/workflow/state.rs`'s `StateManager` (load/save-by-id,
//! directory-scan `list`/`find_latest`) generalized onto the `PersistentBackend` trait (§6.3)
//! rather than a bespoke one-file-per-run format. The heartbeat background task has no teacher
//! counterpart; it is a plain `tokio::spawn` + `tokio::select!` loop rather than a `statig` state
//! machine, since there is nothing here beyond "tick or stop".

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::PersistentBackend;
use crate::task::{PhaseStatus, Task, TaskStatus};
use crate::Result;

/// Thin wrapper over `PersistentBackend` for the acquire/heartbeat/release lifecycle an
/// executor goes through while it owns a task (§3 invariant: at most one executor at a time).
pub struct ExecutionStateStore<'a> {
    backend: &'a dyn PersistentBackend,
}

impl<'a> ExecutionStateStore<'a> {
    pub fn new(backend: &'a dyn PersistentBackend) -> Self {
        Self { backend }
    }

    /// Compare-and-set ownership acquisition (§3). Returns `false` without error if another
    /// executor's heartbeat is still fresh.
    pub async fn acquire(&self, task_id: &str, pid: u32, hostname: &str, staleness: StdDuration) -> Result<bool> {
        let mut task = self.backend.load_task(task_id).await?;
        let acquired = task.substate.try_acquire(
            pid,
            hostname,
            Utc::now(),
            chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::seconds(60)),
        );
        if acquired {
            task.status = TaskStatus::Running;
            task.updated_at = Utc::now();
            self.backend.save_task(&task).await?;
            self.backend.set_task_executor(task_id, pid, hostname).await?;
        }
        Ok(acquired)
    }

    pub async fn release(&self, task_id: &str) -> Result<()> {
        self.backend.clear_task_executor(task_id).await
    }

    pub async fn heartbeat_once(&self, task_id: &str) -> Result<()> {
        let mut task = self.backend.load_task(task_id).await?;
        task.substate.heartbeat(Utc::now());
        self.backend.save_task(&task).await
    }

    /// Ability to resume (§4.9): any prior completed phase and at least one non-completed one.
    pub async fn resumable(&self, task_id: &str) -> Result<bool> {
        let task = self.backend.load_task(task_id).await?;
        Ok(task.is_resumable())
    }

    /// Mark every `running` task whose heartbeat is older than `staleness` as `paused`, enabling
    /// resume elsewhere (§4.9 orphan reaper).
    pub async fn reap_stale(&self, staleness: StdDuration) -> Result<Vec<String>> {
        let staleness = chrono::Duration::from_std(staleness).unwrap_or(chrono::Duration::seconds(60));
        let now = Utc::now();
        let mut reaped = Vec::new();

        for mut task in self.backend.load_all_tasks().await? {
            if task.status == TaskStatus::Running && task.substate.is_stale(now, staleness) {
                task.status = TaskStatus::Paused;
                task.updated_at = now;
                task.substate.clear_executor();
                self.backend.save_task(&task).await?;
                self.backend.clear_task_executor(&task.id).await?;
                warn!("task {} heartbeat stale, marked paused", task.id);
                reaped.push(task.id);
            }
        }
        Ok(reaped)
    }
}

/// Background heartbeat: updates a task's heartbeat on a fixed interval until stopped or the
/// task completes.
pub struct HeartbeatRunner {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl HeartbeatRunner {
    pub fn spawn(backend: Arc<dyn PersistentBackend>, task_id: String, interval: StdDuration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(mut task) = backend.load_task(&task_id).await {
                            task.substate.heartbeat(Utc::now());
                            if let Err(e) = backend.save_task(&task).await {
                                warn!("heartbeat save failed for task {}: {}", task_id, e);
                            }
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("heartbeat stopped for task {}", task_id);
                            break;
                        }
                    }
                }
            }
        });

        Self { handle, stop_tx }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Resume (§4.9): reload completed-phase outputs into the variable map, returning the first
/// non-complete phase's id in topological order, or `None` if every phase is already complete.
pub fn first_incomplete_phase(task: &Task, ordered_phase_ids: &[String]) -> Option<String> {
    ordered_phase_ids
        .iter()
        .find(|id| task.substate.phase_status(id) != PhaseStatus::Completed)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::file_backend::FileBackend;
    use crate::task::Task;

    #[tokio::test]
    async fn test_acquire_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let task = Task::new("T-1", "title", "desc");
        backend.save_task(&task).await.unwrap();

        let store = ExecutionStateStore::new(&backend);
        assert!(store.acquire("T-1", 100, "host-a", StdDuration::from_secs(30)).await.unwrap());

        let reloaded = backend.load_task("T-1").await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Running);
        assert!(reloaded.substate.executor.is_some());

        store.release("T-1").await.unwrap();
        let reloaded = backend.load_task("T-1").await.unwrap();
        assert!(reloaded.substate.executor.is_none());
    }

    #[tokio::test]
    async fn test_acquire_blocked_by_live_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let task = Task::new("T-1", "title", "desc");
        backend.save_task(&task).await.unwrap();

        let store = ExecutionStateStore::new(&backend);
        assert!(store.acquire("T-1", 100, "host-a", StdDuration::from_secs(30)).await.unwrap());
        assert!(!store.acquire("T-1", 200, "host-b", StdDuration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_reap_stale_pauses_running_task_with_old_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let mut task = Task::new("T-1", "title", "desc");
        task.status = TaskStatus::Running;
        task.substate.try_acquire(
            100,
            "host-a",
            Utc::now() - chrono::Duration::seconds(120),
            chrono::Duration::seconds(0),
        );
        backend.save_task(&task).await.unwrap();

        let store = ExecutionStateStore::new(&backend);
        let reaped = store.reap_stale(StdDuration::from_secs(30)).await.unwrap();
        assert_eq!(reaped, vec!["T-1".to_string()]);

        let reloaded = backend.load_task("T-1").await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Paused);
    }

    #[test]
    fn test_first_incomplete_phase() {
        let mut task = Task::new("T-1", "t", "d");
        task.substate.set_phase_status("specify", PhaseStatus::Completed);
        let order = vec!["specify".to_string(), "implement".to_string(), "review".to_string()];
        assert_eq!(first_incomplete_phase(&task, &order), Some("implement".to_string()));
    }

    #[test]
    fn test_first_incomplete_phase_none_when_all_complete() {
        let mut task = Task::new("T-1", "t", "d");
        task.substate.set_phase_status("specify", PhaseStatus::Completed);
        let order = vec!["specify".to_string()];
        assert_eq!(first_incomplete_phase(&task, &order), None);
    }
}
