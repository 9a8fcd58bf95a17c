//! File-based default implementation of [`PersistentBackend`].
//!
//! Grounded on `descartes-v2/src/workflow/state.rs`'s `StateManager`: one JSON/YAML document per
//! record, directory-scan to enumerate, atomic-enough write-then-rename avoided in favor of the
//! teacher's plain `std::fs::write` since the teacher never needed crash-atomicity either.
//!
//! Layout (§6.6): `<root>/tasks/<task_id>/task.yaml`, `<root>/tasks/<task_id>/spec.md`,
//! `<root>/tasks/<task_id>/artifacts/<phase_id>.md`,
//! `<root>/tasks/<task_id>/findings-<round>.yaml`, `<root>/runs/<run_id>.yaml`,
//! `<root>/runs/<run_id>/phases/<template_id>.yaml`,
//! `<root>/runs/<run_id>/outputs/<phase_id>.yaml`, `<root>/constitution.md`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::review::ReviewFindings;
use crate::task::Task;
use crate::{Error, Result};

use super::{PersistentBackend, PhaseOutput, PhaseRunRecord, WorkflowRun};

pub struct FileBackend {
    root: PathBuf,
    task_seq: AtomicU64,
    run_seq: AtomicU64,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("tasks"))?;
        std::fs::create_dir_all(root.join("runs"))?;

        let task_seq = next_sequence(&root.join("tasks"), "T-")?;
        let run_seq = next_sequence(&root.join("runs"), "R-")?;

        Ok(Self {
            root,
            task_seq: AtomicU64::new(task_seq),
            run_seq: AtomicU64::new(run_seq),
        })
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(task_id)
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    fn write_yaml<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(value)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
        let content = std::fs::read_to_string(path)?;
        let value = serde_yaml::from_str(&content)?;
        Ok(value)
    }
}

/// Scan `dir` for entries named `<prefix><n>...` and return `n_max + 1`, or 0 if none exist.
fn next_sequence(dir: &Path, prefix: &str) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut max_seen = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(rest) = name.strip_prefix(prefix) {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse::<u64>() {
                max_seen = max_seen.max(n);
            }
        }
    }
    Ok(if max_seen == 0 && !has_any_entry(dir, prefix)? {
        0
    } else {
        max_seen + 1
    })
}

fn has_any_entry(dir: &Path, prefix: &str) -> Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[async_trait]
impl PersistentBackend for FileBackend {
    async fn get_next_task_id(&self) -> Result<String> {
        let n = self.task_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("T-{}", n))
    }

    async fn get_next_workflow_run_id(&self) -> Result<String> {
        let n = self.run_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("R-{}", n))
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let path = self.task_dir(&task.id).join("task.yaml");
        Self::write_yaml(&path, task)
    }

    async fn load_task(&self, id: &str) -> Result<Task> {
        let path = self.task_dir(id).join("task.yaml");
        Self::read_yaml(&path)
    }

    async fn load_all_tasks(&self) -> Result<Vec<Task>> {
        let dir = self.root.join("tasks");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let task_path = entry.path().join("task.yaml");
            if task_path.exists() {
                tasks.push(Self::read_yaml(&task_path)?);
            }
        }
        tasks.sort_by(|a: &Task, b: &Task| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn save_workflow_run(&self, run: &WorkflowRun) -> Result<()> {
        let path = self.run_dir(&run.id).join("run.yaml");
        Self::write_yaml(&path, run)
    }

    async fn save_workflow_run_phase(&self, record: &PhaseRunRecord) -> Result<()> {
        let path = self
            .run_dir(&record.run_id)
            .join("phases")
            .join(format!("{}.yaml", record.template_id));
        Self::write_yaml(&path, record)
    }

    async fn set_task_executor(&self, task_id: &str, pid: u32, hostname: &str) -> Result<()> {
        let mut task = self.load_task(task_id).await?;
        let now = Utc::now();
        if !task.substate.try_acquire(pid, hostname, now, chrono::Duration::seconds(60)) {
            return Err(Error::TaskBlocked(format!(
                "task {} is already owned by a live executor",
                task_id
            )));
        }
        self.save_task(&task).await
    }

    async fn clear_task_executor(&self, task_id: &str) -> Result<()> {
        let mut task = self.load_task(task_id).await?;
        task.substate.clear_executor();
        self.save_task(&task).await
    }

    async fn save_phase_output(&self, output: &PhaseOutput) -> Result<()> {
        let path = self
            .run_dir(&output.run_id)
            .join("outputs")
            .join(format!("{}.yaml", output.phase_id));
        Self::write_yaml(&path, output)
    }

    async fn get_phase_output(&self, run_id: &str, phase_id: &str) -> Result<Option<PhaseOutput>> {
        let path = self.run_dir(run_id).join("outputs").join(format!("{}.yaml", phase_id));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_yaml(&path)?))
    }

    async fn save_artifact(&self, task_id: &str, phase_id: &str, content: &str) -> Result<()> {
        let path = self.task_dir(task_id).join("artifacts").join(format!("{}.md", phase_id));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    async fn load_artifact(&self, task_id: &str, phase_id: &str) -> Result<Option<String>> {
        let path = self.task_dir(task_id).join("artifacts").join(format!("{}.md", phase_id));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    async fn load_spec(&self, task_id: &str) -> Result<Option<String>> {
        let path = self.task_dir(task_id).join("spec.md");
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    async fn load_review_findings(&self, task_id: &str, round: u32) -> Result<Option<ReviewFindings>> {
        let path = self.task_dir(task_id).join(format!("findings-{}.yaml", round));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_yaml(&path)?))
    }

    async fn save_review_findings(
        &self,
        task_id: &str,
        round: u32,
        findings: &ReviewFindings,
    ) -> Result<()> {
        let path = self.task_dir(task_id).join(format!("findings-{}.yaml", round));
        Self::write_yaml(&path, findings)
    }

    async fn load_constitution(&self) -> Result<Option<String>> {
        let path = self.root.join("constitution.md");
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[tokio::test]
    async fn test_save_and_load_task_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(tmp.path()).unwrap();

        let task = Task::new("T-0", "Add widget", "desc");
        backend.save_task(&task).await.unwrap();
        let loaded = backend.load_task("T-0").await.unwrap();
        assert_eq!(loaded.title, "Add widget");
    }

    #[tokio::test]
    async fn test_get_next_task_id_increments() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(tmp.path()).unwrap();

        let first = backend.get_next_task_id().await.unwrap();
        let second = backend.get_next_task_id().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_phase_output_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(tmp.path()).unwrap();

        let output = PhaseOutput {
            run_id: "R-0".to_string(),
            phase_id: "spec".to_string(),
            output_var_name: "spec_text".to_string(),
            content: "the spec".to_string(),
            produced_at: Utc::now(),
        };
        backend.save_phase_output(&output).await.unwrap();
        let loaded = backend.get_phase_output("R-0", "spec").await.unwrap().unwrap();
        assert_eq!(loaded.content, "the spec");
    }

    #[tokio::test]
    async fn test_missing_artifact_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(tmp.path()).unwrap();
        assert!(backend.load_artifact("T-nope", "spec").await.unwrap().is_none());
    }
}
