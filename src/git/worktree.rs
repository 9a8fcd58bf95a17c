//! Worktree Manager (§4.3).
//!
//! `SetupWorktree(task, config, git) -> {path, target_branch, reused}`; `Cleanup(path)`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::GitConfig;
use crate::task::Task;
use crate::{Error, Result};

use super::Git;

pub struct WorktreeHandle {
    pub path: PathBuf,
    pub target_branch: String,
    pub reused: bool,
}

/// Why `WorktreeManager::cleanup` is being invoked, since the policy differs per trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTrigger {
    Completion,
    Failure,
    /// Sync failed before any phase ran: unconditional, no user work can have been lost yet.
    SyncSetup,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        self.repo_root.join(".orc/worktrees").join(branch)
    }

    /// Resolve the target branch with the precedence task override > initiative default >
    /// config default > `main` (§4.3). This engine has no initiative-level config layer, so the
    /// chain collapses to task override > config default.
    fn resolve_target_branch(&self, task_override: Option<&str>, config: &GitConfig) -> String {
        task_override
            .map(str::to_string)
            .unwrap_or_else(|| config.default_target_branch.clone())
    }

    pub async fn setup_worktree(
        &self,
        task: &Task,
        task_target_branch: Option<&str>,
        config: &GitConfig,
        git: &dyn Git,
    ) -> Result<WorktreeHandle> {
        let branch = task.branch_name();
        let target_branch = self.resolve_target_branch(task_target_branch, config);
        let path = self.worktree_path(&branch);

        if path.exists() {
            return Ok(WorktreeHandle {
                path,
                target_branch,
                reused: true,
            });
        }

        let branch_exists = git.branch_exists_locally(&branch).await?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add", &path.to_string_lossy(), &branch])
                .current_dir(&self.repo_root)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| Error::Git(e.to_string()))?
        } else {
            Command::new("git")
                .args([
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    &path.to_string_lossy(),
                    &target_branch,
                ])
                .current_dir(&self.repo_root)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| Error::Git(e.to_string()))?
        };

        if !output.status.success() {
            return Err(Error::Git(format!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(WorktreeHandle {
            path,
            target_branch,
            reused: branch_exists,
        })
    }

    /// Cleanup policy: on completion iff `cleanup_on_completion`; on failure iff
    /// `cleanup_on_failure`; unconditionally on `SyncSetup`.
    pub async fn cleanup(
        &self,
        path: &Path,
        git: &dyn Git,
        config: &GitConfig,
        trigger: CleanupTrigger,
    ) -> Result<()> {
        let should_clean = match trigger {
            CleanupTrigger::Completion => config.cleanup_on_completion,
            CleanupTrigger::Failure => config.cleanup_on_failure,
            CleanupTrigger::SyncSetup => true,
        };
        if !should_clean {
            return Ok(());
        }
        git.cleanup_worktree_at_path(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_target_branch_prefers_task_override() {
        let manager = WorktreeManager::new("/repo");
        let config = GitConfig {
            default_target_branch: "main".to_string(),
            cleanup_on_completion: true,
            cleanup_on_failure: false,
            fail_on_conflict: false,
            conflict_count_threshold: 10,
            completion_action: "none".to_string(),
        };
        assert_eq!(
            manager.resolve_target_branch(Some("release/2.0"), &config),
            "release/2.0"
        );
        assert_eq!(manager.resolve_target_branch(None, &config), "main");
    }

    #[test]
    fn test_worktree_path_is_conventional() {
        let manager = WorktreeManager::new("/repo");
        let path = manager.worktree_path("orc/T-1");
        assert_eq!(path, PathBuf::from("/repo/.orc/worktrees/orc/T-1"));
    }
}
