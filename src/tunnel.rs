//! Tunnel executable resolution and command construction.

use crate::defaults::TUNNEL_HOSTNAME;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

const TUNNEL_BIN: &str = if cfg!(windows) { "ngrok.exe" } else { "ngrok" };

/// Locate the tunnel executable: a copy next to the launcher wins, then PATH.
/// `None` means the tunnel is skipped for this run.
pub fn resolve_tunnel_executable(work_dir: &Path) -> Option<PathBuf> {
    resolve_with_path(work_dir, std::env::var_os("PATH").as_deref())
}

fn resolve_with_path(work_dir: &Path, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let local = work_dir.join(TUNNEL_BIN);
    if local.exists() {
        return Some(local);
    }

    std::env::split_paths(path_var?)
        .map(|dir| dir.join(TUNNEL_BIN))
        .find(|candidate| candidate.is_file())
}

/// Argument vector binding the fixed public hostname to the local port.
pub fn tunnel_args(port: u16) -> Vec<String> {
    vec![
        "http".to_string(),
        format!("--url={TUNNEL_HOSTNAME}"),
        port.to_string(),
    ]
}
