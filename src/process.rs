//! Process handles - non-blocking liveness plus bounded graceful termination.

use parking_lot::RwLock;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::process::Child;

/// How a termination request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Process exited within the grace period.
    Graceful,
    /// Grace period elapsed (or the wait failed) and the process was killed.
    Forced,
    /// The handle no longer owned a live process.
    AlreadyGone,
}

/// An OS process owned by the supervision session.
///
/// Reader tasks take the stdio pipes at spawn time and never touch the
/// handle; only the owning session terminates it.
pub struct ProcessHandle {
    pid: AtomicU32,
    child: RwLock<Option<Child>>,
    exit: RwLock<Option<ExitStatus>>,
}

impl ProcessHandle {
    pub fn new(child: Child) -> Self {
        let pid = child.id().unwrap_or(0);
        Self {
            pid: AtomicU32::new(pid),
            child: RwLock::new(Some(child)),
            exit: RwLock::new(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Non-blocking exit query. `None` while the process is still running.
    /// The status is cached once the process has been reaped.
    pub fn try_status(&self) -> Option<ExitStatus> {
        if let Some(status) = *self.exit.read() {
            return Some(status);
        }

        let mut slot = self.child.write();
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *self.exit.write() = Some(status);
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to query process status");
                None
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.child.read().is_some() && self.try_status().is_none()
    }

    /// Request graceful termination, wait up to `grace`, escalate to a kill.
    ///
    /// Takes the child out of the handle, so a second call is a no-op.
    pub async fn terminate(&self, grace: Duration) -> TerminateOutcome {
        if self.exit.read().is_some() {
            self.child.write().take();
            return TerminateOutcome::AlreadyGone;
        }

        let Some(mut child) = self.child.write().take() else {
            return TerminateOutcome::AlreadyGone;
        };

        request_graceful(&child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                *self.exit.write() = Some(status);
                TerminateOutcome::Graceful
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Wait after terminate failed, forcing kill");
                self.force_kill(child).await
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid(), "Graceful stop timed out, forcing kill");
                self.force_kill(child).await
            }
        }
    }

    /// Kill and reap, caching the status so `try_status` keeps reporting the
    /// exit after the handle has given up the child.
    async fn force_kill(&self, mut child: Child) -> TerminateOutcome {
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "Kill failed");
        }
        match child.wait().await {
            Ok(status) => *self.exit.write() = Some(status),
            Err(e) => tracing::warn!(error = %e, "Failed to reap killed process"),
        }
        TerminateOutcome::Forced
    }
}

#[cfg(unix)]
fn request_graceful(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) with a constant signal.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_graceful(_child: &Child) {
    // No SIGTERM equivalent; the bounded wait falls through to kill().
}
