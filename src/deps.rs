//! Dependency gate - decides whether `npm install` must run before launch.

use crate::defaults::INSTALL_MARKER;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const NPM_BIN: &str = if cfg!(windows) { "npm.cmd" } else { "npm" };

/// Pure filesystem query. Install is required when `node_modules` is absent,
/// or when `package.json` exists and is newer than the install marker (a
/// missing marker counts as stale). A missing manifest alone never triggers.
pub fn needs_install(server_dir: &Path) -> bool {
    if !server_dir.join("node_modules").exists() {
        tracing::info!("node_modules missing, install required");
        return true;
    }

    let manifest = server_dir.join("package.json");
    if !manifest.exists() {
        return false;
    }

    let marker = server_dir.join(INSTALL_MARKER);
    match (mtime(&manifest), mtime(&marker)) {
        (Some(_), None) => {
            tracing::info!("install marker missing, install required");
            true
        }
        (Some(manifest_time), Some(marker_time)) if manifest_time > marker_time => {
            tracing::info!("package.json updated since last install, install required");
            true
        }
        _ => false,
    }
}

/// Run `npm install --legacy-peer-deps` in the server directory.
///
/// An install failure is logged and the launch continues: a partially
/// populated dependency tree may still let the server start. The marker is
/// touched after every attempt so an unchanged manifest stops re-triggering.
pub async fn run_install(server_dir: &Path) {
    tracing::info!(dir = %server_dir.display(), "Running npm install");

    let result = tokio::process::Command::new(NPM_BIN)
        .args(["install", "--legacy-peer-deps"])
        .current_dir(server_dir)
        .status()
        .await;

    match result {
        Ok(status) if status.success() => {
            tracing::info!("npm install completed");
        }
        Ok(status) => {
            tracing::warn!(%status, "npm install failed, attempting launch anyway");
        }
        Err(e) => {
            tracing::warn!(error = %e, "npm install could not run, attempting launch anyway");
        }
    }

    touch_marker(server_dir);
}

fn touch_marker(server_dir: &Path) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default();
    if let Err(e) = std::fs::write(server_dir.join(INSTALL_MARKER), stamp) {
        tracing::warn!(error = %e, "Failed to write install marker");
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
