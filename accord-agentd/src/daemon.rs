//! Scheduler daemon
//!
//! After writing its pid file (and tearing down any stale prior instance),
//! the daemon loops: reap children, decide between full and environment
//! reload, match the schedule against the current time classes, splay, and
//! spawn the agent. Every sleep is interruptible by runagent connections
//! and by signals; termination is cooperative at each suspension point.

use accord_core::{AccordResult, AgentConfig, DaemonConfig, Policy, Rval};
use accord_engine::classes::{eval_class_expr, ClassView};
use accord_engine::discover::time_classes;
use accord_engine::pending_termination;
use chrono::Local;
use rand::Rng;
use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::task::JoinSet;

use crate::agent;
use crate::runagent::{self, RunagentSocket};
use crate::signals::{self, SignalFlags};

/// What `schedule_run` decided to do this pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    /// The validated-at stamp advanced and the new policy parses: reload
    /// policy and execution config, rediscover the environment.
    Full,
    /// Nothing new on disk: rediscover the environment only.
    Environment,
}

/// Compare the on-disk validated-at stamp with the remembered one.
pub fn reload_decision(
    on_disk: Option<SystemTime>,
    remembered: Option<SystemTime>,
) -> ReloadKind {
    match (on_disk, remembered) {
        (Some(disk), Some(known)) if disk > known => ReloadKind::Full,
        (Some(_), None) => ReloadKind::Full,
        _ => ReloadKind::Environment,
    }
}

/// Modification time of the validated-at stamp file.
pub fn validated_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

struct TimeClassView(HashSet<String>);

impl ClassView for TimeClassView {
    fn is_defined(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    fn for_each(&self, f: &mut dyn FnMut(&str)) {
        for name in &self.0 {
            f(name);
        }
    }
}

/// True when any schedule entry matches the time classes of `t`.
pub fn run_is_due<Tz: chrono::TimeZone>(
    schedule: &[String],
    t: &chrono::DateTime<Tz>,
) -> bool {
    let view = TimeClassView(time_classes(t).into_iter().collect());
    schedule
        .iter()
        .any(|expr| eval_class_expr(expr, &view).unwrap_or(false))
}

/// Pull executor overrides (`schedule`, `splaytime`) out of the policy's
/// `body executor control`, when present.
pub fn apply_exec_config(policy: &Policy, config: &mut DaemonConfig) {
    let control = match policy.body("executor", "control") {
        Some(control) => control,
        None => return,
    };
    for constraint in &control.constraints {
        match constraint.lval.as_str() {
            "schedule" => {
                if let Rval::List(items) = &constraint.rval {
                    config.schedule = items
                        .iter()
                        .filter_map(|i| i.as_scalar().map(str::to_string))
                        .collect();
                }
            }
            "splaytime" => {
                if let Some(minutes) = constraint.rval.as_scalar().and_then(|s| s.parse::<u64>().ok())
                {
                    config.splay_seconds = minutes * 60;
                }
            }
            "exec_command" => {
                if let Some(command) = constraint.rval.as_scalar() {
                    config.agent_command = Some(command.to_string());
                }
            }
            _ => {}
        }
    }
}

/// The scheduler daemon.
pub struct Daemon {
    agent_config: AgentConfig,
    daemon_config: DaemonConfig,
    remembered_validated_at: Option<SystemTime>,
    flags: SignalFlags,
    children: JoinSet<()>,
}

impl Daemon {
    pub fn new(agent_config: AgentConfig, daemon_config: DaemonConfig) -> Self {
        Self {
            agent_config,
            daemon_config,
            remembered_validated_at: None,
            flags: SignalFlags::new(),
            children: JoinSet::new(),
        }
    }

    /// The daemon main loop; returns the process exit code.
    pub async fn run(mut self) -> AccordResult<i32> {
        signals::ignore_sigpipe();
        signals::install(&self.flags)?;

        std::fs::create_dir_all(&self.agent_config.state_dir)?;
        self.apoptosis();
        self.write_pid_file()?;

        let socket = match &self.daemon_config.runagent_socket_dir {
            Some(dir) => Some(RunagentSocket::bind(
                dir,
                &self.daemon_config.runagent_allow_users,
            )?),
            None => None,
        };

        // Initial load fixes the starting point for reload comparisons.
        self.schedule_run();

        loop {
            if pending_termination() {
                break;
            }

            self.reap_children();
            self.schedule_run();

            if run_is_due(&self.daemon_config.schedule, &Local::now()) {
                let splay = if self.daemon_config.splay_seconds > 0 {
                    rand::thread_rng().gen_range(0..=self.daemon_config.splay_seconds)
                } else {
                    0
                };
                tracing::debug!(splay, "run due, splaying");
                self.interruptible_sleep(Duration::from_secs(splay), socket.as_ref())
                    .await;
                if pending_termination() {
                    break;
                }
                self.spawn_agent().await;
            }

            if self.daemon_config.once {
                break;
            }

            self.interruptible_sleep(
                Duration::from_secs(self.daemon_config.pulse_seconds),
                socket.as_ref(),
            )
            .await;
        }

        tracing::info!("daemon shutting down");
        drop(socket); // unlinks the runagent socket
        self.children.shutdown().await;
        let _ = std::fs::remove_file(self.daemon_config.pid_file_path(&self.agent_config));
        Ok(0)
    }

    /// Decide between full and environment reload for this pulse. SIGHUP
    /// forces a full reload.
    fn schedule_run(&mut self) {
        let stamp_path = self.agent_config.validated_at_path();
        let on_disk = validated_at(&stamp_path);
        let forced = self.flags.take_reload_request();

        let decision = if forced {
            ReloadKind::Full
        } else {
            reload_decision(on_disk, self.remembered_validated_at)
        };

        match decision {
            ReloadKind::Full => {
                if agent::policy_is_valid(&self.agent_config) {
                    let policy = agent::load_policy(&self.agent_config);
                    apply_exec_config(&policy, &mut self.daemon_config);
                    tracing::info!("full reload: policy and execution config refreshed");
                } else {
                    tracing::warn!("validated stamp advanced but policy does not parse, keeping previous");
                }
                self.remembered_validated_at = on_disk;
            }
            ReloadKind::Environment => {
                // The environment is rediscovered when the next agent run
                // builds its context; nothing to refresh here.
                tracing::trace!("environment reload");
            }
        }
    }

    /// Non-blocking reap of finished children.
    fn reap_children(&mut self) {
        while let Some(result) = self.children.try_join_next() {
            if let Err(e) = result {
                tracing::warn!(error = %e, "child task ended abnormally");
            }
        }
    }

    /// Start a scheduled agent run: a child process when one can be
    /// spawned, an inline run otherwise. Spawn failure never takes the
    /// daemon down.
    async fn spawn_agent(&mut self) {
        let command = self.agent_command_line();
        tracing::info!(command = ?command, "starting agent run");

        let mut builder = tokio::process::Command::new(&command[0]);
        builder.args(&command[1..]);
        if let Some(path) = &self.daemon_config.ld_library_path {
            builder.env("LD_LIBRARY_PATH", path);
        }

        match builder.spawn() {
            Ok(mut child) => {
                self.children.spawn(async move {
                    match child.wait().await {
                        Ok(status) => tracing::info!(%status, "agent child finished"),
                        Err(e) => tracing::warn!(error = %e, "agent child wait failed"),
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "spawn failed, running agent inline");
                let config = self.agent_config.clone();
                let result =
                    tokio::task::spawn_blocking(move || agent::run_agent_once(&config)).await;
                match result {
                    Ok(Ok(code)) => tracing::info!(code, "inline agent run finished"),
                    Ok(Err(e)) => tracing::error!(error = %e, "inline agent run failed"),
                    Err(e) => tracing::error!(error = %e, "inline agent task panicked"),
                }
            }
        }
    }

    fn agent_command_line(&self) -> Vec<String> {
        if let Some(command) = &self.daemon_config.agent_command {
            return command.split_whitespace().map(str::to_string).collect();
        }
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "accord-agentd".to_string());
        vec![exe, "--once".to_string()]
    }

    /// Sleep that wakes for runagent connections and signals. Connections
    /// are handed to short-lived tasks; the sleep keeps counting.
    async fn interruptible_sleep(&mut self, duration: Duration, socket: Option<&RunagentSocket>) {
        if duration.is_zero() || pending_termination() {
            return;
        }
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        // Cloned out of self so the select arms don't pin a borrow of the
        // whole daemon while handlers need it mutably.
        let wakeup = self.flags.wakeup.clone();

        loop {
            match socket {
                Some(sock) => {
                    tokio::select! {
                        _ = &mut sleep => return,
                        _ = wakeup.notified() => {
                            if pending_termination() {
                                return;
                            }
                        }
                        accepted = sock.accept() => match accepted {
                            Ok(stream) => {
                                let command = self.runagent_command_line();
                                self.children.spawn(runagent::handle_connection(stream, command));
                            }
                            Err(e) => tracing::warn!(error = %e, "runagent accept failed"),
                        },
                    }
                }
                None => {
                    tokio::select! {
                        _ = &mut sleep => return,
                        _ = wakeup.notified() => {
                            if pending_termination() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn runagent_command_line(&self) -> Vec<String> {
        if let Some(command) = &self.daemon_config.runagent_command {
            return command.split_whitespace().map(str::to_string).collect();
        }
        self.agent_command_line()
    }

    /// Deliver SIGTERM to a stale prior instance recorded in the pid file.
    fn apoptosis(&self) {
        let pid_path = self.daemon_config.pid_file_path(&self.agent_config);
        let stale = std::fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        let stale = match stale {
            Some(pid) if pid != std::process::id() as i32 => pid,
            _ => return,
        };

        let pid = nix::unistd::Pid::from_raw(stale);
        if nix::sys::signal::kill(pid, None).is_ok() {
            tracing::info!(stale, "terminating stale prior instance");
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        }
    }

    fn write_pid_file(&self) -> AccordResult<()> {
        let pid_path = self.daemon_config.pid_file_path(&self.agent_config);
        std::fs::write(&pid_path, format!("{}\n", std::process::id()))?;
        tracing::debug!(pid_file = %pid_path.display(), "pid file written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_engine::{clear_pending_termination, set_pending_termination};
    use chrono::{TimeZone, Utc};
    use std::time::Instant;

    #[test]
    fn test_reload_decision_advancing_stamp() {
        let earlier = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(200);

        assert_eq!(
            reload_decision(Some(later), Some(earlier)),
            ReloadKind::Full
        );
        assert_eq!(
            reload_decision(Some(earlier), Some(earlier)),
            ReloadKind::Environment
        );
        assert_eq!(reload_decision(Some(earlier), None), ReloadKind::Full);
        assert_eq!(reload_decision(None, Some(earlier)), ReloadKind::Environment);
        assert_eq!(reload_decision(None, None), ReloadKind::Environment);
    }

    #[test]
    fn test_touching_stamp_triggers_full_reload() {
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let stamp = tmp.path().join("promises_validated");

        assert_eq!(validated_at(&stamp), None);
        std::fs::write(&stamp, b"1").expect("write should succeed");
        let first = validated_at(&stamp).expect("mtime should exist");
        assert_eq!(reload_decision(Some(first), Some(first)), ReloadKind::Environment);

        // Re-touch with a strictly later mtime.
        let later = SystemTime::now() + Duration::from_secs(10);
        let file = std::fs::File::options()
            .write(true)
            .open(&stamp)
            .expect("open should succeed");
        file.set_modified(later).expect("set_modified should succeed");
        let second = validated_at(&stamp).expect("mtime should exist");
        assert_eq!(reload_decision(Some(second), Some(first)), ReloadKind::Full);
    }

    #[test]
    fn test_run_is_due_matches_five_minute_window() {
        let schedule = vec!["Min00_05".to_string()];
        let inside = Utc.with_ymd_and_hms(2026, 8, 1, 10, 3, 0).single()
            .expect("timestamp should be valid");
        let outside = Utc.with_ymd_and_hms(2026, 8, 1, 10, 7, 0).single()
            .expect("timestamp should be valid");

        assert!(run_is_due(&schedule, &inside));
        assert!(!run_is_due(&schedule, &outside));
    }

    #[test]
    fn test_run_is_due_accepts_expressions() {
        let schedule = vec!["Hr10.Weekday".to_string()];
        // 2026-08-03 is a Monday.
        let monday = Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).single()
            .expect("timestamp should be valid");
        let saturday = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).single()
            .expect("timestamp should be valid");

        assert!(run_is_due(&schedule, &monday));
        assert!(!run_is_due(&schedule, &saturday));
    }

    #[test]
    fn test_apply_exec_config_overrides() {
        let policy = accord_dsl::parse_policy(
            r#"
            body executor control
            {
              schedule => { "Min00_05", "Min30_35" };
              splaytime => "2";
            }
            "#,
            "exec.acc",
        )
        .expect("parse should succeed");

        let mut config = DaemonConfig::default();
        apply_exec_config(&policy, &mut config);
        assert_eq!(config.schedule, vec!["Min00_05", "Min30_35"]);
        assert_eq!(config.splay_seconds, 120);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_termination() {
        clear_pending_termination();
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let agent_config = AgentConfig::default().with_workdir(tmp.path());
        let mut daemon = Daemon::new(agent_config, DaemonConfig::default());

        let wakeup = daemon.flags.wakeup.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            set_pending_termination();
            wakeup.notify_waiters();
        });

        let started = Instant::now();
        daemon
            .interruptible_sleep(Duration::from_secs(30), None)
            .await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "sleep should end at the next suspension point"
        );
        clear_pending_termination();
    }
}
