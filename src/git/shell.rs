//! Subprocess-backed [`Git`] implementation, shelling out to the system `git` binary.
//!
//! Grounded on `descartes-v2/src/ralph_loop.rs`'s `git_commit`/`git_push`: check the exit
//! status, treat `git add`/`git push` failures as recoverable where the spec agrees, and
//! classify everything else (rebase/merge conflicts) explicitly rather than swallowing them.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{Error, Result};

use super::Git;

pub struct ShellGit {
    cwd: PathBuf,
}

impl ShellGit {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Git(format!("failed to run git {:?}: {}", args, e)))
    }

    async fn run_ok(&self, args: &[&str]) -> Result<bool> {
        Ok(self.run(args).await?.status.success())
    }
}

#[async_trait]
impl Git for ShellGit {
    async fn in_worktree(&self, path: &Path) -> Result<bool> {
        let output = Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(path)
            .output()
            .await
            .map_err(|e| Error::Git(e.to_string()))?;
        Ok(output.status.success())
    }

    async fn fetch(&self, remote: &str) -> Result<()> {
        let output = self.run(&["fetch", remote]).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "git fetch {} failed: {}",
                remote,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.push(remote);
        args.push(branch);
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "git push failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn has_remote(&self, name: &str) -> Result<bool> {
        let output = self.run(&["remote"]).await?;
        let remotes = String::from_utf8_lossy(&output.stdout);
        Ok(remotes.lines().any(|r| r == name))
    }

    async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        let refspec = format!("refs/remotes/{}/{}", remote, branch);
        self.run_ok(&["show-ref", "--verify", "--quiet", &refspec]).await
    }

    async fn get_commit_counts(&self, reference: &str) -> Result<(u32, u32)> {
        let spec = format!("HEAD...{}", reference);
        let output = self
            .run(&["rev-list", "--left-right", "--count", &spec])
            .await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "git rev-list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok((ahead, behind))
    }

    async fn rebase_with_conflict_check(&self, reference: &str) -> Result<()> {
        let output = self.run(&["rebase", reference]).await?;
        if output.status.success() {
            return Ok(());
        }
        let _ = self.run(&["rebase", "--abort"]).await;
        Err(Error::SyncConflict(format!(
            "rebase onto {} conflicted: {}",
            reference,
            String::from_utf8_lossy(&output.stderr)
        )))
    }

    async fn merge(&self, branch: &str, no_ff: bool) -> Result<()> {
        let mut args = vec!["merge"];
        if no_ff {
            args.push("--no-ff");
        }
        args.push(branch);
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let _ = self.run(&["merge", "--abort"]).await;
        Err(Error::MergeFailed(format!(
            "merge of {} conflicted: {}",
            branch,
            String::from_utf8_lossy(&output.stderr)
        )))
    }

    async fn checkout_safe(&self, branch: &str) -> Result<()> {
        let output = self.run(&["checkout", branch]).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "checkout {} failed: {}",
                branch,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn create_checkpoint(&self, task_id: &str, phase_id: &str, label: &str) -> Result<()> {
        let added = self.run_ok(&["add", "-A"]).await?;
        if !added {
            return Ok(());
        }
        let clean = self.run_ok(&["diff", "--cached", "--quiet"]).await?;
        if clean {
            return Ok(());
        }
        let message = format!("orc: {} / {} — {}", task_id, phase_id, label);
        let output = self.run(&["commit", "-m", &message]).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "checkpoint commit failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn cleanup_worktree_at_path(&self, path: &Path) -> Result<()> {
        let output = self
            .run(&["worktree", "remove", "--force", &path.to_string_lossy()])
            .await?;
        if !output.status.success() {
            // The worktree directory may already be gone; don't fail cleanup on that.
            if path.exists() {
                return Err(Error::Git(format!(
                    "worktree remove failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }
        Ok(())
    }

    async fn auto_resolve_conflicts(&self, files: &[String]) -> Result<Vec<String>> {
        // No automatic resolution strategy is implemented; every conflicted file is reported
        // back as unresolved for the implement phase to handle.
        Ok(files.to_vec())
    }

    async fn reset_hard(&self, reference: &str) -> Result<()> {
        let output = self.run(&["reset", "--hard", reference]).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "reset --hard {} failed: {}",
                reference,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn branch_exists_locally(&self, branch: &str) -> Result<bool> {
        let refspec = format!("refs/heads/{}", branch);
        self.run_ok(&["show-ref", "--verify", "--quiet", &refspec]).await
    }

    async fn create_branch_from(&self, branch: &str, base: &str) -> Result<()> {
        let output = self.run(&["branch", branch, base]).await?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "creating branch {} from {} failed: {}",
                branch,
                base,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_has_remote_false_outside_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let git = ShellGit::new(tmp.path());
        // Not a git repo at all; `git remote` exits non-zero so we expect an error, not a panic.
        let result = git.has_remote("origin").await;
        assert!(result.is_err());
    }
}
