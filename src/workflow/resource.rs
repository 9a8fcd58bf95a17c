//! Resource accounting and branch serialisation (§4.6, §5): a best-effort process snapshot taken
//! before and after a run to flag subprocesses that outlived it, and a per-branch lease so two
//! concurrent completion actions in the same process never race on the same target branch.
//!
//! Grounded on `descartes-v2/src/ralph_loop.rs`'s shell-out-and-check-status style for the
//! snapshot (matching how this crate already shells out to git and backpressure checks, rather
//! than adding a process-inspection dependency for a diagnostic-only feature); the branch lease
//! is new, following §5's "simple map of branch -> lock behind a mutex" directly.

use std::collections::{HashMap, HashSet};
use std::process::Command;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

/// Capture the current set of live process ids on this host, best-effort. Returns an empty set
/// if `ps` is unavailable rather than failing the run over a diagnostic.
pub fn snapshot_pids() -> HashSet<u32> {
    match Command::new("ps").args(["-eo", "pid"]).output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        _ => HashSet::new(),
    }
}

/// Log any pid present in `after` but absent from `before` — a process spawned during the run
/// that is still alive once it finished. Candidates only; never fatal, never alters task state.
pub fn log_orphan_candidates(task_id: &str, before: &HashSet<u32>, after: &HashSet<u32>) {
    for pid in after.difference(before) {
        warn!(task_id, pid, "process spawned during run is still alive after completion");
    }
}

/// Per-target-branch lease registry: serialises completion actions (merge/push) on the same
/// branch across concurrent tasks sharing one `WorkflowRunner`-hosting process.
#[derive(Default, Clone)]
pub struct BranchLeases {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl BranchLeases {
    pub async fn acquire(&self, branch: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(branch.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_orphan_candidates_does_not_panic_on_real_diff() {
        let before: HashSet<u32> = [1, 2, 3].into_iter().collect();
        let after: HashSet<u32> = [1, 2, 3, 4].into_iter().collect();
        log_orphan_candidates("T-1", &before, &after);
    }

    #[tokio::test]
    async fn test_branch_leases_serialises_same_branch() {
        let leases = BranchLeases::default();
        let guard = leases.acquire("main").await;
        let leases2 = leases.clone();
        let second = tokio::spawn(async move {
            let _guard = leases2.acquire("main").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        drop(guard);
        second.await.unwrap();
    }

    #[tokio::test]
    async fn test_branch_leases_different_branches_do_not_block() {
        let leases = BranchLeases::default();
        let _guard = leases.acquire("main").await;
        let other = tokio::time::timeout(std::time::Duration::from_millis(100), leases.acquire("feature"))
            .await;
        assert!(other.is_ok());
    }
}
