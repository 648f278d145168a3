//! Agent and daemon configuration
//!
//! Built from defaults, then the environment, then command-line flags, in
//! that order. The work directory holds inputs and legacy databases; the
//! state directory holds the live databases, pid file, timestamp files and
//! the runagent socket.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the work directory, for tests.
pub const TEST_OVERRIDE_WORKDIR: &str = "ACCORD_TEST_OVERRIDE_WORKDIR";

const DEFAULT_WORKDIR: &str = "/var/accord";

/// Settings shared by every agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub work_dir: PathBuf,
    pub state_dir: PathBuf,
    pub inputs_dir: PathBuf,
    /// The entry policy file; relative paths resolve against `inputs_dir`.
    pub input_file: PathBuf,
    /// Evaluate without mutating host state; actuators warn instead.
    pub dry_run: bool,
    /// Skip ifelapsed/expireafter checks (`--no-lock`).
    pub ignore_locks: bool,
    /// Soft classes defined on the command line.
    pub define_classes: Vec<String>,
    /// Classes explicitly undefined on the command line.
    pub negate_classes: Vec<String>,
    /// Skip the host-specific augments variant.
    pub ignore_preferred_augments: bool,
    /// Force the start-up database verification on or off; `None` lets the
    /// repair flag file decide.
    pub skip_db_check: Option<bool>,
    /// Abort policy loading after this many accumulated errors.
    pub max_policy_errors: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let work_dir = default_workdir();
        Self {
            state_dir: work_dir.join("state"),
            inputs_dir: work_dir.join("inputs"),
            input_file: PathBuf::from("promises.acc"),
            work_dir,
            dry_run: false,
            ignore_locks: false,
            define_classes: Vec::new(),
            negate_classes: Vec::new(),
            ignore_preferred_augments: false,
            skip_db_check: None,
            max_policy_errors: 12,
        }
    }
}

impl AgentConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Rebase every path onto the given work directory.
    pub fn with_workdir(mut self, work_dir: impl AsRef<Path>) -> Self {
        let work_dir = work_dir.as_ref().to_path_buf();
        self.state_dir = work_dir.join("state");
        self.inputs_dir = work_dir.join("inputs");
        self.work_dir = work_dir;
        self
    }

    /// The absolute path of the entry policy file.
    pub fn resolved_input_file(&self) -> PathBuf {
        if self.input_file.is_absolute() {
            self.input_file.clone()
        } else {
            self.inputs_dir.join(&self.input_file)
        }
    }

    /// Augments file next to the entry policy (`def.json`).
    pub fn augments_file(&self) -> PathBuf {
        self.inputs_dir.join("def.json")
    }

    /// Host-preferred augments variant (`def_preferred.json`).
    pub fn preferred_augments_file(&self) -> PathBuf {
        self.inputs_dir.join("def_preferred.json")
    }

    /// Timestamp file advanced when a new policy has been validated.
    pub fn validated_at_path(&self) -> PathBuf {
        self.state_dir.join("promises_validated")
    }

    /// Release-id file written alongside the validated-at timestamp.
    pub fn release_id_path(&self) -> PathBuf {
        self.state_dir.join("release_id")
    }

    /// Flag file requesting a database verification sweep on next start.
    pub fn repair_flag_path(&self) -> PathBuf {
        self.state_dir.join("repair.flag")
    }
}

fn default_workdir() -> PathBuf {
    match std::env::var(TEST_OVERRIDE_WORKDIR) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_WORKDIR),
    }
}

/// Scheduler daemon settings, on top of [`AgentConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Time classes any of which make an agent run due.
    pub schedule: Vec<String>,
    /// Upper bound of the random delay before a due run, seconds.
    pub splay_seconds: u64,
    /// Main-loop pulse, seconds.
    pub pulse_seconds: u64,
    /// Agent binary invoked for scheduled runs; `None` runs the agent
    /// in-process.
    pub agent_command: Option<String>,
    /// Stay in the foreground instead of daemonizing.
    pub no_fork: bool,
    /// Run one scheduling cycle and exit.
    pub once: bool,
    /// Directory for the runagent control socket; `None` disables it.
    pub runagent_socket_dir: Option<PathBuf>,
    /// Users allowed to connect to the runagent socket.
    pub runagent_allow_users: Vec<String>,
    /// Command run on behalf of a runagent request.
    pub runagent_command: Option<String>,
    /// Value exported to children as LD_LIBRARY_PATH, when given.
    pub ld_library_path: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            schedule: vec![
                "Min00_05".to_string(),
                "Min05_10".to_string(),
                "Min10_15".to_string(),
                "Min15_20".to_string(),
                "Min20_25".to_string(),
                "Min25_30".to_string(),
                "Min30_35".to_string(),
                "Min35_40".to_string(),
                "Min40_45".to_string(),
                "Min45_50".to_string(),
                "Min50_55".to_string(),
                "Min55_00".to_string(),
            ],
            splay_seconds: 30,
            pulse_seconds: 60,
            agent_command: None,
            no_fork: false,
            once: false,
            runagent_socket_dir: None,
            runagent_allow_users: Vec::new(),
            runagent_command: None,
            ld_library_path: None,
        }
    }
}

impl DaemonConfig {
    /// Pid file for the daemon process.
    pub fn pid_file_path(&self, agent: &AgentConfig) -> PathBuf {
        agent.state_dir.join("accord-execd.pid")
    }

    /// Full socket path inside the configured socket directory.
    pub fn runagent_socket_path(&self) -> Option<PathBuf> {
        self.runagent_socket_dir
            .as_ref()
            .map(|dir| dir.join("runagent.socket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_rebase_with_workdir() {
        let config = AgentConfig::default().with_workdir("/tmp/acc-test");
        assert_eq!(config.state_dir, PathBuf::from("/tmp/acc-test/state"));
        assert_eq!(config.inputs_dir, PathBuf::from("/tmp/acc-test/inputs"));
        assert_eq!(
            config.resolved_input_file(),
            PathBuf::from("/tmp/acc-test/inputs/promises.acc")
        );
        assert_eq!(
            config.validated_at_path(),
            PathBuf::from("/tmp/acc-test/state/promises_validated")
        );
    }

    #[test]
    fn test_absolute_input_file_wins() {
        let mut config = AgentConfig::default();
        config.input_file = PathBuf::from("/etc/accord/site.acc");
        assert_eq!(
            config.resolved_input_file(),
            PathBuf::from("/etc/accord/site.acc")
        );
    }

    #[test]
    fn test_runagent_socket_path() {
        let mut daemon = DaemonConfig::default();
        assert_eq!(daemon.runagent_socket_path(), None);
        daemon.runagent_socket_dir = Some(PathBuf::from("/tmp/sock"));
        assert_eq!(
            daemon.runagent_socket_path(),
            Some(PathBuf::from("/tmp/sock/runagent.socket"))
        );
    }
}
