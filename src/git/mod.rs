//! Git (collaborator) external interface (§6.5), Worktree Manager (§4.3), and Sync Engine
//! (§4.4).
//!
//! Grounded on `descartes-v2/src/ralph_loop.rs`'s `git_commit`/`git_push` subprocess style
//! (shell out, check exit status, treat failures as recoverable where the teacher already did).
//! Worktree-per-task isolation and rebase/conflict classification have no teacher counterpart
//! and are built fresh from §4.3/§4.4. `gix` (used by the sibling `descartes` workspace) was
//! considered and rejected: §6.5 names git as an external collaborator interface, not an
//! embedding detail, so shelling out to the user's own git binary keeps behavior identical to
//! what a human operator would get.

pub mod shell;
pub mod sync;
pub mod worktree;

pub use shell::ShellGit;
pub use sync::SyncEngine;
pub use worktree::{CleanupTrigger, WorktreeHandle, WorktreeManager};

use async_trait::async_trait;

use crate::Result;

/// Git primitives required by the engine (§6.5). Implemented against one repository root plus,
/// where relevant, a specific worktree path.
#[async_trait]
pub trait Git: Send + Sync {
    fn branch_name(&self, task_id: &str) -> String {
        format!("orc/{}", task_id)
    }

    async fn in_worktree(&self, path: &std::path::Path) -> Result<bool>;
    async fn fetch(&self, remote: &str) -> Result<()>;
    async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> Result<()>;
    async fn has_remote(&self, name: &str) -> Result<bool>;

    /// Whether `<remote>/<branch>` exists as a remote-tracking ref. Callers fetch first;
    /// checked locally against `refs/remotes/<remote>/<branch>` rather than hitting the
    /// network a second time.
    async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool>;

    /// `(ahead, behind)` commit counts of HEAD relative to `reference`.
    async fn get_commit_counts(&self, reference: &str) -> Result<(u32, u32)>;

    /// Rebase HEAD onto `reference`. Returns `Err(Error::SyncConflict(..))` on conflict.
    async fn rebase_with_conflict_check(&self, reference: &str) -> Result<()>;

    /// Merge `branch` into HEAD. Returns `Err(Error::MergeFailed(..))` on conflict.
    async fn merge(&self, branch: &str, no_ff: bool) -> Result<()>;

    async fn checkout_safe(&self, branch: &str) -> Result<()>;

    /// Commit whatever is staged/unstaged with a message encoding `task_id`/`phase_id`/`label`.
    async fn create_checkpoint(&self, task_id: &str, phase_id: &str, label: &str) -> Result<()>;

    async fn cleanup_worktree_at_path(&self, path: &std::path::Path) -> Result<()>;

    /// Best-effort automatic conflict resolution over `files` (e.g. trivial whitespace-only
    /// conflicts). Returns the subset still unresolved.
    async fn auto_resolve_conflicts(&self, files: &[String]) -> Result<Vec<String>>;

    async fn reset_hard(&self, reference: &str) -> Result<()>;
    async fn branch_exists_locally(&self, branch: &str) -> Result<bool>;
    async fn create_branch_from(&self, branch: &str, base: &str) -> Result<()>;
}
