//! Output relay - drains the server's stdout/stderr into the log stream.
//!
//! The two pipes stay separate at the OS level and are merged here, line by
//! line, through one classification path. Interleaving between the streams is
//! therefore per-line rather than per-write.

use crate::defaults::READY_MARKER;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};

/// Classification of one line of server output. The two checks are
/// independent; a single line can be both an error and the ready marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineClass {
    pub error: bool,
    pub ready: bool,
}

pub fn classify_line(line: &str) -> LineClass {
    LineClass {
        error: line.to_ascii_lowercase().contains("error"),
        ready: line.contains(READY_MARKER),
    }
}

fn relay_line(line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let class = classify_line(line);
    if class.error {
        tracing::error!("[server] {line}");
    } else {
        tracing::info!("[server] {line}");
    }
    if class.ready {
        tracing::info!("Server is ready and accepting connections");
    }
}

/// Drain both halves of the server's output until the streams close.
///
/// The server is spawned with stdout and stderr piped; both feed the same
/// classification path so operators see one merged stream. Runs with no
/// synchronization against the poll loop.
pub async fn relay_output(stdout: ChildStdout, stderr: ChildStderr) {
    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            line = out.next_line(), if out_open => match line {
                Ok(Some(line)) => relay_line(&line),
                Ok(None) => out_open = false,
                Err(e) => {
                    tracing::debug!(error = %e, "Server stdout read failed");
                    out_open = false;
                }
            },
            line = err.next_line(), if err_open => match line {
                Ok(Some(line)) => relay_line(&line),
                Ok(None) => err_open = false,
                Err(e) => {
                    tracing::debug!(error = %e, "Server stderr read failed");
                    err_open = false;
                }
            },
        }
    }

    tracing::debug!("Server output stream closed");
}
