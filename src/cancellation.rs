//! Run-wide cancellation (§5).
//!
//! A single cancellation context wraps the whole run, signalled by (a) an OS pause signal, (b)
//! parent context cancellation, or (c) internal fatal transitions. Every blocking operation
//! (turn execution, git subprocess, store read/write, script invocation) takes this token rather
//! than polling a flag in a sleep loop.
//!
//! Grounded on `descartes-v2/src/interactive/signals.rs`'s `SignalHandler`, narrowed to a single
//! pause signal — this engine has no interactive double-Ctrl+C distinction, since a gate is
//! already the only place a human is asked for input.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::Result;

#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        *self.reason.lock().unwrap() = Some(reason.into());
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    /// Install an OS pause-signal (platform-specific user signal #1, per §6.7) handler that
    /// cancels this token. Safe to call at most once per process.
    pub fn install_pause_signal(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            token.cancel("pause signal received");
        })
        .map_err(|e| crate::Error::Config(format!("failed to install pause signal handler: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_sets_flag_and_reason() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel("user pressed pause");
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("user pressed pause".to_string()));
    }

    #[test]
    fn test_clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel("from clone");
        assert!(token.is_cancelled());
    }
}
