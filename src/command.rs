//! Launch command resolution.
//!
//! Three tiers, in priority order: compiled production bundle, locally
//! installed ts-node, `npx ts-node` on demand. This is the only place
//! startup-mode selection happens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

const TS_NODE_BIN: &str = if cfg!(windows) { "ts-node.cmd" } else { "ts-node" };

/// Fully resolved launch invocation for the managed server.
///
/// Discrete argument tokens, never a shell string. The environment overlay
/// always carries `PORT` and `NODE_ENV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    fn new(program: impl Into<String>, args: &[&str], cwd: &Path, port: u16) -> Self {
        let mut env = HashMap::new();
        env.insert("PORT".to_string(), port.to_string());
        env.insert("NODE_ENV".to_string(), "production".to_string());
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            env,
        }
    }

    /// Build the tokio command; stdio and spawn policy stay with the caller.
    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.cwd).envs(&self.env);
        cmd
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Decide how to start the server. Pure decision tree over `server_dir`.
pub fn resolve_launch_command(server_dir: &Path, port: u16) -> LaunchCommand {
    if server_dir.join("dist/server/index.js").exists() {
        tracing::info!("Mode: production (compiled bundle)");
        return LaunchCommand::new("node", &["dist/server/index.js"], server_dir, port);
    }

    let ts_node = server_dir.join("node_modules/.bin").join(TS_NODE_BIN);
    if ts_node.exists() {
        tracing::info!("Mode: development (local ts-node)");
        return LaunchCommand::new(ts_node.to_string_lossy(), &["index.ts"], server_dir, port);
    }

    tracing::info!("Mode: development (npx ts-node fallback)");
    LaunchCommand::new("npx", &["--yes", "ts-node", "index.ts"], server_dir, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn compiled_bundle_selects_production_command() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("dist/server")).unwrap();
        std::fs::write(dir.path().join("dist/server/index.js"), "").unwrap();
        // A local ts-node must lose to the compiled bundle.
        std::fs::create_dir_all(dir.path().join("node_modules/.bin")).unwrap();
        std::fs::write(dir.path().join("node_modules/.bin").join(TS_NODE_BIN), "").unwrap();

        let cmd = resolve_launch_command(dir.path(), 3001);
        assert_eq!(cmd.program, "node");
        assert_eq!(cmd.args, vec!["dist/server/index.js"]);
        assert_eq!(cmd.cwd, dir.path());
    }

    #[test]
    fn local_ts_node_selects_dev_command() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/.bin")).unwrap();
        let ts_node = dir.path().join("node_modules/.bin").join(TS_NODE_BIN);
        std::fs::write(&ts_node, "").unwrap();

        let cmd = resolve_launch_command(dir.path(), 3001);
        assert_eq!(cmd.program, ts_node.to_string_lossy());
        assert_eq!(cmd.args, vec!["index.ts"]);
    }

    #[test]
    fn neither_present_falls_back_to_npx() {
        let dir = TempDir::new().unwrap();

        let cmd = resolve_launch_command(dir.path(), 3001);
        assert_eq!(cmd.program, "npx");
        assert_eq!(cmd.args, vec!["--yes", "ts-node", "index.ts"]);
    }

    #[test]
    fn env_overlay_carries_port_and_run_mode() {
        let dir = TempDir::new().unwrap();
        let cmd = resolve_launch_command(dir.path(), 4100);
        assert_eq!(cmd.env.get("PORT").map(String::as_str), Some("4100"));
        assert_eq!(cmd.env.get("NODE_ENV").map(String::as_str), Some("production"));
    }

    #[test]
    fn display_joins_program_and_args() {
        let dir = TempDir::new().unwrap();
        let cmd = resolve_launch_command(dir.path(), 3001);
        assert_eq!(cmd.display(), "npx --yes ts-node index.ts");
    }
}
