use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3001;

/// Public hostname the tunnel binds, from the deployment's reserved domain.
pub const TUNNEL_HOSTNAME: &str = "robbi-unglutted-oretha.ngrok-free.dev";

/// Substring the server prints once it accepts connections.
pub const READY_MARKER: &str = "Server is running";

pub const SERVER_DIR: &str = "server";
pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "headless-launcher.log";
pub const INSTALL_MARKER: &str = ".npm_install_marker";

pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const PORT_RECLAIM_SETTLE: Duration = Duration::from_secs(1);
pub const TUNNEL_SETTLE: Duration = Duration::from_secs(2);
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const TUNNEL_STOP_TIMEOUT: Duration = Duration::from_secs(2);
pub const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(3);
/// How long shutdown waits for background tasks to drain before abandoning the join.
pub const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
