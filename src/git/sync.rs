//! Sync Engine (§4.4): start-sync and completion-sync.

use crate::config::GitConfig;
use crate::Result;

use super::Git;

pub struct SyncEngine<'a> {
    git: &'a dyn Git,
    config: &'a GitConfig,
}

impl<'a> SyncEngine<'a> {
    pub fn new(git: &'a dyn Git, config: &'a GitConfig) -> Self {
        Self { git, config }
    }

    /// Bring the local task branch up to date with remote and target before the first phase.
    ///
    /// 1. Fetch origin.
    /// 2. If a remote task branch exists, merge it in; on conflict, reset hard to the remote
    ///    branch (remote wins — it already held pushed WIP from a prior interrupted run). On a
    ///    brand-new task there is no remote task branch yet, so this step is skipped entirely.
    /// 3. If local is behind `origin/<target>`, rebase onto it.
    /// 4. On rebase conflict, classify by count: `fail_on_conflict` or count over threshold is
    ///    fatal; otherwise let the implement phase resolve it.
    pub async fn start_sync(&self, task_branch: &str, target_branch: &str) -> Result<()> {
        self.git.fetch("origin").await?;

        let remote_task_branch = format!("origin/{}", task_branch);
        if self.git.remote_branch_exists("origin", task_branch).await? {
            match self.git.merge(&remote_task_branch, false).await {
                Ok(()) => {}
                Err(_) => {
                    // Remote wins on merge conflict: the remote branch already held pushed WIP.
                    self.git.reset_hard(&remote_task_branch).await?;
                }
            }
        }

        let remote_target = format!("origin/{}", target_branch);
        let (_, behind) = self.git.get_commit_counts(&remote_target).await?;
        if behind > 0 {
            if let Err(e) = self.git.rebase_with_conflict_check(&remote_target).await {
                let (_, conflict_count) = self.git.get_commit_counts(&remote_target).await.unwrap_or((0, 0));
                if self.config.fail_on_conflict
                    || conflict_count as usize > self.config.conflict_count_threshold
                {
                    return Err(e);
                }
                // Otherwise: continue with the conflict still present; the implement phase is
                // expected to resolve it as part of its normal work.
            }
        }

        Ok(())
    }

    /// Run before creating a PR / merging: re-fetch and re-rebase onto the (possibly moved)
    /// target branch, surfacing any conflict as fatal at completion.
    pub async fn completion_sync(&self, task_branch: &str, target_branch: &str) -> Result<()> {
        let _ = task_branch;
        self.git.fetch("origin").await?;
        let remote_target = format!("origin/{}", target_branch);
        self.git.rebase_with_conflict_check(&remote_target).await
    }
}
