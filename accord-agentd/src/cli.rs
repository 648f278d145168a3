//! Command-line interface

use accord_core::{AgentConfig, DaemonConfig};
use clap::Parser;
use std::path::PathBuf;

/// Declarative configuration agent and scheduler daemon.
#[derive(Debug, Parser)]
#[command(name = "accord-agentd", version, about)]
pub struct Cli {
    /// Policy entry file (relative paths resolve against the inputs dir).
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Define these classes before evaluation.
    #[arg(short = 'D', long = "define", value_name = "CLASS")]
    pub define: Vec<String>,

    /// Undefine these classes before evaluation.
    #[arg(short = 'N', long = "negate", value_name = "CLASS")]
    pub negate: Vec<String>,

    /// Ignore ifelapsed/expireafter locks.
    #[arg(short = 'K', long = "no-lock")]
    pub no_lock: bool,

    /// Report what the agent is doing.
    #[arg(short = 'I', long)]
    pub inform: bool,

    /// Verbose diagnostics.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Debug-level diagnostics.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Explicit log level (error, warn, info, debug, trace); wins over the
    /// shorthand flags.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Evaluate without changing host state.
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'F', long = "no-fork")]
    pub no_fork: bool,

    /// Run the agent once and exit instead of looping.
    #[arg(short = 'O', long)]
    pub once: bool,

    /// Accepted for compatibility; meaningless off Windows.
    #[arg(long = "no-winsrv", hide = true)]
    pub no_winsrv: bool,

    /// Export this LD_LIBRARY_PATH to child processes.
    #[arg(long = "ld-library-path", value_name = "PATH")]
    pub ld_library_path: Option<String>,

    /// Colorize log output.
    #[arg(long)]
    pub color: bool,

    /// Prefix log lines with timestamps.
    #[arg(long)]
    pub timestamp: bool,

    /// Skip the host-preferred augments variant.
    #[arg(long = "ignore-preferred-augments")]
    pub ignore_preferred_augments: bool,

    /// Skip (or force) the start-up database check.
    #[arg(
        long = "skip-db-check",
        value_name = "yes|no",
        num_args = 0..=1,
        default_missing_value = "yes"
    )]
    pub skip_db_check: Option<String>,

    /// Directory for the runagent control socket, or "no" to disable.
    #[arg(long = "with-runagent-socket", value_name = "DIR|no")]
    pub with_runagent_socket: Option<String>,
}

impl Cli {
    /// Resolve the agent configuration from defaults, environment and flags.
    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::from_env();
        if let Some(file) = &self.file {
            config.input_file = file.clone();
        }
        config.dry_run = self.dry_run;
        config.ignore_locks = self.no_lock;
        config.define_classes = self.define.clone();
        config.negate_classes = self.negate.clone();
        config.ignore_preferred_augments = self.ignore_preferred_augments;
        config.skip_db_check = self.skip_db_check.as_deref().map(|v| v != "no");
        config
    }

    /// Resolve the daemon configuration.
    pub fn daemon_config(&self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.no_fork = self.no_fork;
        config.once = self.once;
        config.ld_library_path = self.ld_library_path.clone();
        config.runagent_socket_dir = match self.with_runagent_socket.as_deref() {
            None | Some("no") => None,
            Some(dir) => Some(PathBuf::from(dir)),
        };
        config
    }

    /// The tracing filter directive implied by the flags.
    pub fn log_filter(&self) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        if self.debug {
            "trace".to_string()
        } else if self.verbose {
            "debug".to_string()
        } else if self.inform {
            "info".to_string()
        } else {
            "warn".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_mapping() {
        let cli = Cli::parse_from([
            "accord-agentd",
            "--file",
            "site.acc",
            "-D",
            "staging",
            "-D",
            "canary",
            "-N",
            "production",
            "--no-lock",
            "--dry-run",
            "--skip-db-check=no",
            "--with-runagent-socket",
            "/tmp/sock",
        ]);

        let agent = cli.agent_config();
        assert_eq!(agent.input_file, PathBuf::from("site.acc"));
        assert_eq!(agent.define_classes, vec!["staging", "canary"]);
        assert_eq!(agent.negate_classes, vec!["production"]);
        assert!(agent.ignore_locks);
        assert!(agent.dry_run);
        assert_eq!(agent.skip_db_check, Some(false));

        let daemon = cli.daemon_config();
        assert_eq!(
            daemon.runagent_socket_dir,
            Some(PathBuf::from("/tmp/sock"))
        );
    }

    #[test]
    fn test_skip_db_check_bare_means_yes() {
        let cli = Cli::parse_from(["accord-agentd", "--skip-db-check"]);
        assert_eq!(cli.agent_config().skip_db_check, Some(true));
    }

    #[test]
    fn test_runagent_socket_no_disables() {
        let cli = Cli::parse_from(["accord-agentd", "--with-runagent-socket", "no"]);
        assert_eq!(cli.daemon_config().runagent_socket_dir, None);
    }

    #[test]
    fn test_log_filter_precedence() {
        let cli = Cli::parse_from(["accord-agentd", "--verbose"]);
        assert_eq!(cli.log_filter(), "debug");

        let cli = Cli::parse_from(["accord-agentd", "--verbose", "--log-level", "info"]);
        assert_eq!(cli.log_filter(), "info");

        let cli = Cli::parse_from(["accord-agentd"]);
        assert_eq!(cli.log_filter(), "warn");
    }
}
