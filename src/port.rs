//! Port probing and best-effort reclaim.

use crate::defaults::PORT_PROBE_TIMEOUT;
use std::net::{SocketAddr, TcpStream};

/// Check whether something already listens on `port` locally.
///
/// Fail-open: any connect error (refused, timeout, unreachable) reads as free.
pub fn is_port_busy(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

/// Kill whatever currently holds `port`.
///
/// Advisory cleanup: every failure is logged and swallowed. A port that stays
/// busy surfaces later when the spawn fails or the monitor loop notices.
pub fn free_port(port: u16) {
    tracing::info!(port, "Attempting to free port");

    #[cfg(unix)]
    unix::free_port(port);

    #[cfg(windows)]
    windows::free_port(port);
}

/// Pids reported by `lsof -t`, one per line.
#[cfg_attr(not(unix), allow(dead_code))]
fn pids_from_lsof(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Pids from `netstat -ano` lines that are LISTENING on `port`.
#[cfg_attr(not(windows), allow(dead_code))]
fn pids_from_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    for line in output.lines() {
        if !line.contains("LISTENING") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || !parts[1].ends_with(&suffix) {
            continue;
        }
        let Some(pid_token) = parts.last() else {
            continue;
        };
        if let Ok(pid) = pid_token.parse::<u32>()
            && !pids.contains(&pid)
        {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(unix)]
mod unix {
    use super::pids_from_lsof;

    pub(super) fn free_port(port: u16) {
        let output = match std::process::Command::new("lsof")
            .args(["-t", &format!("-i:{port}")])
            .output()
        {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(port, error = %e, "lsof failed, cannot reclaim port");
                return;
            }
        };

        for pid in pids_from_lsof(&String::from_utf8_lossy(&output.stdout)) {
            // SAFETY: plain kill(2) with a constant signal.
            let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            if rc == 0 {
                tracing::info!(pid, port, "Killed process holding port");
            } else {
                tracing::warn!(
                    pid,
                    port,
                    error = %std::io::Error::last_os_error(),
                    "Failed to kill process holding port"
                );
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::pids_from_netstat;

    pub(super) fn free_port(port: u16) {
        let output = match std::process::Command::new("netstat").arg("-ano").output() {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(port, error = %e, "netstat failed, cannot reclaim port");
                return;
            }
        };

        for pid in pids_from_netstat(&String::from_utf8_lossy(&output.stdout), port) {
            match std::process::Command::new("taskkill")
                .args(["/F", "/PID", &pid.to_string()])
                .output()
            {
                Ok(out) if out.status.success() => {
                    tracing::info!(pid, port, "Killed process holding port");
                }
                Ok(out) => {
                    tracing::warn!(pid, port, status = %out.status, "taskkill failed");
                }
                Err(e) => {
                    tracing::warn!(pid, port, error = %e, "taskkill could not run");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn ephemeral_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .expect("failed to bind ephemeral port")
            .local_addr()
            .expect("failed to read local addr")
            .port()
    }

    #[test]
    fn busy_when_listener_is_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_busy(port));
    }

    #[test]
    fn free_when_nothing_listens() {
        // Listener dropped immediately, port released.
        let port = ephemeral_port();
        assert!(!is_port_busy(port));
    }

    #[test]
    fn free_port_with_no_holder_is_a_noop() {
        let port = ephemeral_port();
        free_port(port);
    }

    #[test]
    fn parses_lsof_pid_list() {
        assert_eq!(pids_from_lsof("1234\n5678\n"), vec![1234, 5678]);
        assert_eq!(pids_from_lsof(""), Vec::<u32>::new());
        // lsof sometimes interleaves warnings on stdout; non-numeric tokens are skipped.
        assert_eq!(pids_from_lsof("1234\nlsof: warning\n"), vec![1234]);
    }

    #[test]
    fn parses_netstat_listening_lines() {
        let output = "\
  TCP    0.0.0.0:3001           0.0.0.0:0              LISTENING       4321\n\
  TCP    0.0.0.0:8080           0.0.0.0:0              LISTENING       9999\n\
  TCP    127.0.0.1:3001         127.0.0.1:52100        ESTABLISHED     4321\n";
        assert_eq!(pids_from_netstat(output, 3001), vec![4321]);
        assert_eq!(pids_from_netstat(output, 8080), vec![9999]);
        assert_eq!(pids_from_netstat(output, 1234), Vec::<u32>::new());
    }

    #[test]
    fn netstat_parse_dedupes_pids() {
        let output = "\
  TCP    0.0.0.0:3001           0.0.0.0:0              LISTENING       4321\n\
  TCP    [::]:3001              [::]:0                 LISTENING       4321\n";
        assert_eq!(pids_from_netstat(output, 3001), vec![4321]);
    }
}
