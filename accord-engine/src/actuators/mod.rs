//! Actuators
//!
//! An actuator materialises one promise type into host state. The
//! dispatcher looks actuators up in a capability table keyed by promise
//! type; each receives the fully-expanded promise and the evaluation
//! context. Actuators must be idempotent, must warn instead of mutating in
//! dry-run mode, and may rate-limit themselves through the promise lock
//! registry.

mod classes;
mod commands;
mod files;
mod reports;
mod vars;

pub use classes::ClassesActuator;
pub use commands::CommandsActuator;
pub use files::FilesActuator;
pub use reports::ReportsActuator;
pub use vars::VarsActuator;

use accord_core::{AccordResult, LockError, Outcome, Promise, PromiseType, Rval};
use accord_store::{promise_lock_key, DbId, LockAttrs};
use std::collections::HashMap;

use crate::context::EvalContext;
use crate::state::EngineState;

/// One promise-type actuator.
pub trait Actuator: Send + Sync {
    fn actuate(
        &self,
        state: &EngineState,
        ctx: &mut EvalContext,
        promise: &Promise,
        now: i64,
    ) -> AccordResult<Outcome>;
}

/// Capability table mapping promise types to their actuators.
pub struct ActuatorTable {
    map: HashMap<PromiseType, Box<dyn Actuator>>,
}

impl ActuatorTable {
    /// The standard set: vars, classes, files, commands, reports.
    /// (`methods` promises are evaluated by the dispatcher itself.)
    pub fn standard() -> Self {
        let mut table = Self {
            map: HashMap::new(),
        };
        table.register(PromiseType::Vars, Box::new(VarsActuator));
        table.register(PromiseType::Meta, Box::new(VarsActuator));
        table.register(PromiseType::Classes, Box::new(ClassesActuator));
        table.register(PromiseType::Files, Box::new(FilesActuator));
        table.register(PromiseType::Commands, Box::new(CommandsActuator));
        table.register(PromiseType::Reports, Box::new(ReportsActuator::new()));
        table
    }

    /// An empty table; embedders register what they support.
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn register(&mut self, promise_type: PromiseType, actuator: Box<dyn Actuator>) {
        self.map.insert(promise_type, actuator);
    }

    pub fn get(&self, promise_type: PromiseType) -> Option<&dyn Actuator> {
        self.map.get(&promise_type).map(|b| b.as_ref())
    }
}

/// Run `critical` under this promise's lock, honouring `ifelapsed` and
/// `expireafter` constraints. Contention and store trouble both degrade to
/// a skipped outcome; they are not failures of the promise itself.
pub(crate) fn with_promise_lock(
    state: &EngineState,
    ctx: &EvalContext,
    promise_type: PromiseType,
    promise: &Promise,
    now: i64,
    critical: impl FnOnce() -> AccordResult<Outcome>,
) -> AccordResult<Outcome> {
    let attrs = LockAttrs {
        ifelapsed_min: constraint_i64(promise, "ifelapsed").unwrap_or(1),
        expireafter_min: constraint_i64(promise, "expireafter").unwrap_or(120),
    };

    let mut selected: Vec<(String, String)> = promise
        .constraints
        .iter()
        .filter_map(|c| {
            c.rval
                .as_scalar()
                .map(|s| (c.lval.clone(), s.to_string()))
        })
        .collect();
    selected.sort();

    let key = promise_lock_key(
        &ctx.current_namespace(),
        &ctx.current_bundle(),
        promise_type.as_keyword(),
        &promise.promiser,
        &selected,
    );

    let held = match state
        .locks
        .acquire(&key, &attrs, state.config.ignore_locks, now)
    {
        Ok(held) => held,
        Err(e) if e.is_contention() => {
            tracing::debug!(promiser = %promise.promiser, reason = %e, "promise lock contended");
            return Ok(Outcome::Skipped);
        }
        Err(LockError::Store(e)) => {
            tracing::warn!(promiser = %promise.promiser, error = %e, "lock store unusable, skipping");
            return Ok(Outcome::Skipped);
        }
        Err(e) => {
            tracing::warn!(promiser = %promise.promiser, error = %e, "lock acquisition failed, skipping");
            return Ok(Outcome::Skipped);
        }
    };

    let outcome = critical()?;

    let finished = state.now();
    if let Err(e) = held.complete(finished) {
        tracing::warn!(error = %e, "failed to record lock completion");
    }
    record_performance(state, &key, finished - now);

    Ok(outcome)
}

/// Best-effort elapsed-time bookkeeping in the performance database.
fn record_performance(state: &EngineState, key: &str, elapsed_secs: i64) {
    let result = state.stores.open(DbId::Performance).and_then(|db| {
        db.write(
            &accord_store::string_key(key),
            &elapsed_secs.to_le_bytes(),
        )
    });
    if let Err(e) = result {
        tracing::debug!(error = %e, "performance record dropped");
    }
}

pub(crate) fn constraint_i64(promise: &Promise, lval: &str) -> Option<i64> {
    promise
        .constraint(lval)
        .and_then(Rval::as_scalar)
        .and_then(|s| s.parse().ok())
}

pub(crate) fn constraint_bool(promise: &Promise, lval: &str) -> bool {
    promise
        .constraint(lval)
        .and_then(Rval::as_scalar)
        .map(|s| s == "true" || s == "yes")
        .unwrap_or(false)
}
