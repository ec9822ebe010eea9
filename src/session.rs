//! Supervision session - the core state machine.
//!
//! One session per run: spawns the server process, relays its output,
//! optionally spawns and watches a tunnel process, polls for liveness, and
//! drives ordered shutdown. The running flag is the single source of truth
//! the poll loop consults; once it is false no new processes are spawned.

use crate::command::LaunchCommand;
use crate::defaults::{
    POLL_INTERVAL, PORT_RECLAIM_SETTLE, SERVER_STOP_TIMEOUT, TASK_JOIN_TIMEOUT, TUNNEL_HOSTNAME,
    TUNNEL_SETTLE, TUNNEL_STOP_TIMEOUT,
};
use crate::output;
use crate::port;
use crate::process::{ProcessHandle, TerminateOutcome};
use crate::tunnel;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: u16,
    pub tunnel: bool,
    pub project_dir: PathBuf,
}

/// Lifecycle states of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// How the session ended; maps directly to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Operator-requested stop completed normally.
    Shutdown,
    /// The server process could not be spawned.
    SpawnFailed,
    /// The server process exited on its own while being monitored.
    UnexpectedExit,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn server process: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct SupervisionSession {
    config: SessionConfig,
    state: SessionState,
    running: Arc<AtomicBool>,
    /// Flips false once the tunnel exits or cannot be started; the poll loop
    /// stops watching it but the server keeps running.
    tunnel_enabled: bool,
    server: Option<Arc<ProcessHandle>>,
    tunnel: Option<Arc<ProcessHandle>>,
    relay_task: Option<JoinHandle<()>>,
    tunnel_watch: Option<JoinHandle<()>>,
}

impl SupervisionSession {
    pub fn new(config: SessionConfig) -> Self {
        let tunnel_enabled = config.tunnel;
        Self {
            config,
            state: SessionState::Init,
            running: Arc::new(AtomicBool::new(true)),
            tunnel_enabled,
            server: None,
            tunnel: None,
            relay_task: None,
            tunnel_watch: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion: reclaim the port if needed, spawn the
    /// server, start the tunnel when requested, monitor until a stop signal
    /// or a process death, then shut everything down.
    pub async fn run(&mut self, command: LaunchCommand) -> SessionOutcome {
        tracing::debug!(config = ?self.config, "Session starting");
        self.state = SessionState::Starting;

        if port::is_port_busy(self.config.port) {
            tracing::warn!(port = self.config.port, "Port is in use, attempting to free it");
            port::free_port(self.config.port);
            tokio::time::sleep(PORT_RECLAIM_SETTLE).await;
        }

        if let Err(e) = self.spawn_server(&command) {
            tracing::error!(error = %e, command = %command.display(), "Failed to start server");
            self.state = SessionState::Failed;
            self.running.store(false, Ordering::SeqCst);
            return SessionOutcome::SpawnFailed;
        }
        self.state = SessionState::Running;

        if self.tunnel_enabled {
            // Give the server a moment to bind before exposing it.
            tokio::time::sleep(TUNNEL_SETTLE).await;
            self.start_tunnel();
        }

        let outcome = self.monitor().await;
        self.state = SessionState::Stopping;
        self.shutdown().await;
        outcome
    }

    fn spawn_server(&mut self, command: &LaunchCommand) -> Result<(), SessionError> {
        apply_test_env_override(&command.cwd);

        tracing::info!(command = %command.display(), port = self.config.port, "Starting server");
        let mut cmd = command.command();
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let handle = Arc::new(ProcessHandle::new(child));
        tracing::info!(pid = ?handle.pid(), "Server process started");

        if let (Some(out), Some(err)) = (stdout, stderr) {
            self.relay_task = Some(tokio::spawn(output::relay_output(out, err)));
        }
        self.server = Some(handle);
        Ok(())
    }

    fn start_tunnel(&mut self) {
        let Some(exe) = tunnel::resolve_tunnel_executable(&self.config.project_dir) else {
            tracing::error!("Tunnel executable not found locally or on PATH, skipping tunnel");
            self.tunnel_enabled = false;
            return;
        };

        let args = tunnel::tunnel_args(self.config.port);
        tracing::info!(exe = %exe.display(), args = ?args, "Starting tunnel");

        let mut cmd = tokio::process::Command::new(&exe);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => {
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                let handle = Arc::new(ProcessHandle::new(child));
                tracing::info!(
                    pid = ?handle.pid(),
                    host = TUNNEL_HOSTNAME,
                    "Tunnel started"
                );

                if let (Some(out), Some(err)) = (stdout, stderr) {
                    self.tunnel_watch = Some(self.spawn_tunnel_watch(handle.clone(), out, err));
                }
                self.tunnel = Some(handle);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start tunnel, continuing without it");
                self.tunnel_enabled = false;
            }
        }
    }

    /// Watch the tunnel process to completion, draining its output streams.
    /// A non-zero exit while the session is still running is an error, but
    /// never stops the server.
    fn spawn_tunnel_watch(
        &self,
        handle: Arc<ProcessHandle>,
        stdout: ChildStdout,
        stderr: ChildStderr,
    ) -> JoinHandle<()> {
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;
            let mut ticker = tokio::time::interval(POLL_INTERVAL);

            loop {
                tokio::select! {
                    line = out.next_line(), if out_open => match line {
                        Ok(Some(line)) if !line.trim().is_empty() => {
                            tracing::debug!("[tunnel] {}", line.trim());
                        }
                        Ok(Some(_)) => {}
                        _ => out_open = false,
                    },
                    line = err.next_line(), if err_open => match line {
                        Ok(Some(line)) if !line.trim().is_empty() => {
                            tracing::debug!("[tunnel:err] {}", line.trim());
                        }
                        Ok(Some(_)) => {}
                        _ => err_open = false,
                    },
                    _ = ticker.tick() => {
                        if let Some(status) = handle.try_status() {
                            if running.load(Ordering::SeqCst) && !status.success() {
                                tracing::error!(%status, "Tunnel process exited with an error");
                            } else {
                                tracing::debug!(%status, "Tunnel process exited");
                            }
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Poll loop: the only place stop signals and process deaths are observed.
    async fn monitor(&mut self) -> SessionOutcome {
        tracing::info!("Monitoring started, press Ctrl-C to stop");

        let stop = stop_signal();
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    tracing::info!("Received stop signal");
                    return SessionOutcome::Shutdown;
                }
                _ = ticker.tick() => {
                    if let Some(server) = &self.server
                        && let Some(status) = server.try_status()
                    {
                        tracing::error!(%status, "Server process exited unexpectedly");
                        self.running.store(false, Ordering::SeqCst);
                        return SessionOutcome::UnexpectedExit;
                    }

                    if self.tunnel_enabled
                        && let Some(tunnel) = &self.tunnel
                        && tunnel.try_status().is_some()
                    {
                        tracing::error!("Tunnel process exited, disabling tunnel monitoring");
                        self.tunnel_enabled = false;
                    }
                }
            }
        }
    }

    /// Ordered teardown: tunnel first, then the server, then an unconditional
    /// port sweep. Invoking it again after completion is a no-op.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Stopped {
            tracing::debug!("Shutdown already completed");
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Shutting down");

        if let Some(tunnel) = self.tunnel.take() {
            match tunnel.terminate(TUNNEL_STOP_TIMEOUT).await {
                TerminateOutcome::Graceful => tracing::info!("Tunnel stopped"),
                TerminateOutcome::Forced => {
                    tracing::warn!("Tunnel killed after graceful stop timed out");
                }
                TerminateOutcome::AlreadyGone => {}
            }
        }
        if let Some(watch) = self.tunnel_watch.take() {
            join_task("tunnel watcher", watch).await;
        }

        if let Some(server) = self.server.take() {
            match server.terminate(SERVER_STOP_TIMEOUT).await {
                TerminateOutcome::Graceful => tracing::info!("Server stopped"),
                TerminateOutcome::Forced => {
                    tracing::warn!("Server killed after graceful stop timed out");
                }
                TerminateOutcome::AlreadyGone => {}
            }
        }
        if let Some(relay) = self.relay_task.take() {
            join_task("output relay", relay).await;
        }

        // The server may have spawned children that outlive a SIGTERM to the
        // parent; sweep the port no matter how the graceful path went.
        port::free_port(self.config.port);

        self.state = SessionState::Stopped;
        tracing::info!("Shutdown complete");
    }
}

async fn join_task(name: &str, mut task: JoinHandle<()>) {
    match tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(task = name, error = %e, "Background task ended with join error");
        }
        Err(_) => {
            tracing::debug!(task = name, "Background task still draining, aborting it");
            task.abort();
        }
    }
}

/// If a `.env.test_clients` override exists it replaces `.env` before spawn.
/// The overwrite is intentional but loud: test deployments ship their client
/// configuration this way.
fn apply_test_env_override(server_dir: &Path) {
    let override_file = server_dir.join(".env.test_clients");
    if !override_file.exists() {
        return;
    }

    let env_file = server_dir.join(".env");
    match std::fs::copy(&override_file, &env_file) {
        Ok(_) => tracing::warn!(
            from = %override_file.display(),
            to = %env_file.display(),
            "Overwrote .env with the test client configuration"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to apply test client configuration"),
    }
}

#[cfg(unix)]
async fn stop_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn unused_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn sh(script: &str, dir: &Path) -> LaunchCommand {
        LaunchCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: dir.to_path_buf(),
            env: HashMap::new(),
        }
    }

    fn config(dir: &Path, tunnel: bool) -> SessionConfig {
        SessionConfig {
            port: unused_port(),
            tunnel,
            project_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn spawn_failure_ends_in_failed_state() {
        let dir = TempDir::new().unwrap();
        let command = LaunchCommand {
            program: "/nonexistent/launcher-test-binary".to_string(),
            args: vec![],
            cwd: dir.path().to_path_buf(),
            env: HashMap::new(),
        };

        let mut session = SupervisionSession::new(config(dir.path(), false));
        let outcome = session.run(command).await;

        assert_eq!(outcome, SessionOutcome::SpawnFailed);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn server_exit_is_detected_and_session_stops() {
        let dir = TempDir::new().unwrap();
        let mut session = SupervisionSession::new(config(dir.path(), false));
        let outcome = session.run(sh("exit 3", dir.path())).await;

        assert_eq!(outcome, SessionOutcome::UnexpectedExit);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.server.is_none());
    }

    #[tokio::test]
    async fn missing_tunnel_executable_does_not_stop_the_session() {
        let dir = TempDir::new().unwrap();
        if tunnel::resolve_tunnel_executable(dir.path()).is_some() {
            eprintln!("skipping: tunnel executable present on PATH");
            return;
        }

        let mut session = SupervisionSession::new(config(dir.path(), true));
        let outcome = session.run(sh("sleep 1", dir.path())).await;

        // The server running to its own exit is the only way this test ends;
        // the absent tunnel must not have interfered.
        assert_eq!(outcome, SessionOutcome::UnexpectedExit);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.tunnel.is_none());
        assert!(!session.tunnel_enabled);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut session = SupervisionSession::new(config(dir.path(), false));

        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        session.server = Some(Arc::new(ProcessHandle::new(child)));
        session.state = SessionState::Running;

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.server.is_none());

        // Second invocation: nothing left to terminate, must not panic.
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_env_override_replaces_env_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "MODE=real").unwrap();
        std::fs::write(dir.path().join(".env.test_clients"), "MODE=test").unwrap();

        apply_test_env_override(dir.path());

        let contents = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(contents, "MODE=test");
    }

    #[tokio::test]
    async fn env_override_absent_leaves_env_untouched() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "MODE=real").unwrap();

        apply_test_env_override(dir.path());

        let contents = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(contents, "MODE=real");
    }
}
