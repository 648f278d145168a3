//! `commands` actuator
//!
//! Runs the promiser as a command under the promise lock, so `ifelapsed`
//! rate-limits repeated executions across processes.

use accord_core::{AccordResult, Outcome, Promise, Rval};
use std::process::Command;

use crate::actuators::{with_promise_lock, Actuator};
use crate::context::EvalContext;
use crate::state::EngineState;

pub struct CommandsActuator;

impl Actuator for CommandsActuator {
    fn actuate(
        &self,
        state: &EngineState,
        ctx: &mut EvalContext,
        promise: &Promise,
        now: i64,
    ) -> AccordResult<Outcome> {
        let dry_run = state.config.dry_run;
        with_promise_lock(
            state,
            ctx,
            accord_core::PromiseType::Commands,
            promise,
            now,
            || run_command(promise, dry_run),
        )
    }
}

fn run_command(promise: &Promise, dry_run: bool) -> AccordResult<Outcome> {
    let mut words = promise.promiser.split_whitespace();
    let program = match words.next() {
        Some(program) => program,
        None => {
            tracing::error!("empty command promiser");
            return Ok(Outcome::Fail);
        }
    };
    let mut args: Vec<&str> = words.collect();

    let extra = promise.constraint("args").and_then(Rval::as_scalar);
    if let Some(extra) = extra {
        args.extend(extra.split_whitespace());
    }

    if dry_run {
        tracing::warn!(command = %promise.promiser, "dry-run: would execute");
        return Ok(Outcome::Warn);
    }

    let output = match Command::new(program).args(&args).output() {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(command = %program, error = %e, "command failed to start");
            return Ok(Outcome::Fail);
        }
    };

    if !output.stdout.is_empty() {
        tracing::debug!(command = %program, stdout = %String::from_utf8_lossy(&output.stdout));
    }

    if output.status.success() {
        tracing::info!(command = %promise.promiser, "command executed");
        Ok(Outcome::Repaired)
    } else {
        tracing::error!(
            command = %promise.promiser,
            code = output.status.code().unwrap_or(-1),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "command returned failure"
        );
        Ok(Outcome::Fail)
    }
}
