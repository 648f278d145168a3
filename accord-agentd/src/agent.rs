//! One-shot agent runs
//!
//! Loads the policy (falling back to the built-in failsafe when the inputs
//! are missing or broken), services the repair flag, runs the engine once,
//! and drains the store registry.

use accord_core::{AccordResult, AgentConfig, Outcome, Policy};
use accord_engine::run::{agent_run, failsafe_policy, tally_worst};
use accord_engine::{ActuatorTable, EngineState};
use accord_store::process_repair_flag;

/// Run the agent once; the returned code is the process exit code.
pub fn run_agent_once(config: &AgentConfig) -> AccordResult<i32> {
    let run_id = uuid::Uuid::now_v7();
    tracing::info!(%run_id, "agent run starting");

    let state = EngineState::new(config.clone())?;

    if let Err(e) = process_repair_flag(
        &state.stores,
        &config.repair_flag_path(),
        config.skip_db_check,
    ) {
        tracing::warn!(error = %e, "database verification failed");
    }

    let policy = load_policy(config);
    let actuators = ActuatorTable::standard();
    let tally = agent_run(&state, &policy, &actuators)?;

    if let Err(e) = state.stores.shutdown() {
        tracing::warn!(error = %e, "store shutdown incomplete");
    }

    let code = match tally_worst(&tally) {
        Outcome::Fail | Outcome::Denied => 1,
        _ => 0,
    };
    tracing::info!(%run_id, code, "agent run finished");
    Ok(code)
}

/// Parse the entry policy with promise-level recovery; individual broken
/// promises are logged and skipped, while a missing file, a structural
/// error, or too many accumulated diagnostics yield the failsafe so the
/// daemon keeps running.
pub fn load_policy(config: &AgentConfig) -> Policy {
    let path = config.resolved_input_file();
    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(file = %path.display(), error = %e, "policy inputs unreadable, using failsafe");
            return failsafe_policy();
        }
    };

    match accord_dsl::parse_policy_resilient(
        &source,
        &path.display().to_string(),
        config.max_policy_errors,
    ) {
        Ok((policy, errors)) => {
            for error in &errors {
                tracing::error!(%error, "policy diagnostic, promise skipped");
            }
            policy
        }
        Err(e) => {
            tracing::error!(file = %path.display(), error = %e, "policy load failed, using failsafe");
            failsafe_policy()
        }
    }
}

/// Syntactic validity probe used by the reload decision: a new policy only
/// replaces the running one when it parses and validates.
pub fn policy_is_valid(config: &AgentConfig) -> bool {
    accord_dsl::parse_policy_file(&config.resolved_input_file()).is_ok()
}
