//! Accord agent daemon entry point
//!
//! Parses flags, initialises tracing, then either runs the agent once
//! (`--once`) or starts the scheduler daemon, backgrounding itself first
//! unless `--no-fork` keeps it in the foreground.

mod agent;
mod cli;
mod daemon;
mod runagent;
mod signals;

use clap::Parser;
use cli::Cli;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let agent_config = cli.agent_config();
    let daemon_config = cli.daemon_config();

    if let Some(path) = &daemon_config.ld_library_path {
        // Propagated to every child we spawn.
        std::env::set_var("LD_LIBRARY_PATH", path);
    }

    if cli.once {
        return match agent::run_agent_once(&agent_config) {
            Ok(0) => ExitCode::SUCCESS,
            Ok(code) => ExitCode::from(code as u8),
            Err(e) => {
                tracing::error!(error = %e, "agent run failed");
                ExitCode::FAILURE
            }
        };
    }

    // Daemonize before the runtime exists; forking after would orphan the
    // tokio worker threads.
    if !daemon_config.no_fork {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("failed to daemonize: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "tokio runtime construction failed");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        daemon::Daemon::new(agent_config, daemon_config).run().await
    });

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(cli.color)
        .with_target(false);

    if cli.timestamp {
        builder.init();
    } else {
        builder.without_time().init();
    }
}
