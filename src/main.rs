mod command;
mod defaults;
mod deps;
mod output;
mod port;
mod process;
mod session;
mod tunnel;

use crate::session::{SessionConfig, SessionOutcome, SupervisionSession};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Headless launcher - supervises the app server and an optional tunnel
#[derive(Parser)]
#[command(name = "headless-launcher")]
#[command(version)]
#[command(about = "Headless supervisor for the application server")]
struct Args {
    /// Server port
    #[arg(
        long,
        default_value_t = defaults::DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,

    /// Expose the server through the public tunnel
    #[arg(long)]
    tunnel: bool,

    /// Skip the npm install check
    #[arg(long)]
    skip_install: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let project_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let _log_guard = init_logging(&project_dir);

    tracing::info!("Headless launcher v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        port = args.port,
        tunnel = args.tunnel,
        skip_install = args.skip_install,
        "Configuration"
    );

    let server_dir = project_dir.join(defaults::SERVER_DIR);

    if !args.skip_install && deps::needs_install(&server_dir) {
        deps::run_install(&server_dir).await;
    }

    let launch = command::resolve_launch_command(&server_dir, args.port);
    tracing::info!(command = %launch.display(), "Server start command");

    let config = SessionConfig {
        port: args.port,
        tunnel: args.tunnel,
        project_dir,
    };
    let mut session = SupervisionSession::new(config);

    match session.run(launch).await {
        SessionOutcome::Shutdown => ExitCode::SUCCESS,
        SessionOutcome::SpawnFailed => ExitCode::from(1),
        SessionOutcome::UnexpectedExit => ExitCode::from(2),
    }
}

/// Two log sinks: a rolling file under `logs/` at DEBUG with file/line
/// fields, and the console at INFO (overridable via RUST_LOG). The returned
/// guard must stay alive so the non-blocking file writer flushes on exit.
fn init_logging(project_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    fn console_filter() -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }

    let log_dir = project_dir.join(defaults::LOG_DIR);
    match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, defaults::LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_filter(LevelFilter::DEBUG);
            let console = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(console_filter());

            tracing_subscriber::registry().with(file).with(console).init();
            Some(guard)
        }
        Err(e) => {
            let console = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(console_filter());
            tracing_subscriber::registry().with(console).init();
            tracing::warn!(
                dir = %log_dir.display(),
                error = %e,
                "Cannot create log directory, console logging only"
            );
            None
        }
    }
}
