//! Agent run orchestration
//!
//! Builds a fresh context, discovers the environment, applies command-line
//! classes and augments, loads persistent classes, walks the bundle
//! sequence, and flushes persistent state back to the store.

use accord_core::{
    AccordResult, Outcome, OutcomeTally, PersistentClass, Policy, Rval, VarRef, VarType,
};
use accord_store::{string_key, DbId};

use crate::actuators::ActuatorTable;
use crate::context::{EvalContext, FrameKind};
use crate::discover;
use crate::dispatch;
use crate::state::EngineState;

/// Run the policy once. Returns the outcome tally of every actuation.
pub fn agent_run(
    state: &EngineState,
    policy: &Policy,
    actuators: &ActuatorTable,
) -> AccordResult<OutcomeTally> {
    let mut ctx = EvalContext::new();
    discover::discover_environment(&mut ctx, &state.config);

    for class in &state.config.define_classes {
        ctx.class_put_hard(class, None);
    }
    for class in &state.config.negate_classes {
        ctx.negate_class(class);
    }

    load_augments(&mut ctx, state)?;
    load_persistent_classes(&mut ctx, state);

    let sequence = bundle_sequence_from_policy(policy);
    let tally = dispatch::run_policy(state, &mut ctx, policy, actuators, sequence.as_deref())?;

    flush_persistent_classes(&mut ctx, state);

    tracing::info!(
        kept = tally.kept,
        repaired = tally.repaired,
        skipped = tally.skipped,
        warned = tally.warned,
        failed = tally.failed,
        denied = tally.denied,
        "agent run complete"
    );
    Ok(tally)
}

/// The worst outcome in a tally, for exit-code decisions.
pub fn tally_worst(tally: &OutcomeTally) -> Outcome {
    if tally.denied > 0 {
        Outcome::Denied
    } else if tally.failed > 0 {
        Outcome::Fail
    } else if tally.warned > 0 {
        Outcome::Warn
    } else if tally.repaired > 0 {
        Outcome::Repaired
    } else if tally.skipped > 0 {
        Outcome::Skipped
    } else {
        Outcome::Kept
    }
}

/// `bundlesequence` from `body common control`, when the policy carries one.
fn bundle_sequence_from_policy(policy: &Policy) -> Option<Vec<String>> {
    let control = policy.body("common", "control")?;
    let rval = control
        .constraints
        .iter()
        .find(|c| c.lval == "bundlesequence")?;
    match &rval.rval {
        Rval::List(items) => Some(
            items
                .iter()
                .filter_map(|i| i.as_scalar().map(str::to_string))
                .collect(),
        ),
        Rval::Scalar(one) => Some(vec![one.clone()]),
        _ => None,
    }
}

/// Merge the optional augments JSON into the context: `vars` land in the
/// `def` scope, `classes` become hard classes.
fn load_augments(ctx: &mut EvalContext, state: &EngineState) -> AccordResult<()> {
    let mut paths = vec![state.config.augments_file()];
    if !state.config.ignore_preferred_augments {
        paths.insert(0, state.config.preferred_augments_file());
    }

    let path = match paths.into_iter().find(|p| p.exists()) {
        Some(path) => path,
        None => return Ok(()),
    };

    let text = std::fs::read_to_string(&path)?;
    let parsed: serde_json::Value = match serde_json::from_str(&text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(file = %path.display(), error = %e, "augments file is not valid JSON");
            return Ok(());
        }
    };

    // Vars live in a synthetic `def` bundle scope; pushing and popping the
    // frame leaves them in the run-wide bundle table.
    ctx.push_frame(FrameKind::Bundle, accord_core::DEFAULT_NAMESPACE, "def");
    if let Some(vars) = parsed.get("vars").and_then(|v| v.as_object()) {
        for (name, value) in vars {
            let (rval, var_type) = match value {
                serde_json::Value::String(s) => (Rval::scalar(s.clone()), VarType::String),
                serde_json::Value::Array(items) => (
                    Rval::List(
                        items
                            .iter()
                            .map(|i| match i {
                                serde_json::Value::String(s) => Rval::scalar(s.clone()),
                                other => Rval::scalar(other.to_string()),
                            })
                            .collect(),
                    ),
                    VarType::Slist,
                ),
                other => (Rval::Container(other.clone()), VarType::Container),
            };
            let r = VarRef::parse(name);
            if let Err(e) = ctx.variable_put(&r, rval, var_type, vec!["source=augments".into()]) {
                tracing::warn!(var = %name, error = %e, "augments variable rejected");
            }
        }
    }
    ctx.pop_frame(FrameKind::Bundle)
        .map_err(accord_core::AccordError::Eval)?;

    if let Some(classes) = parsed.get("classes").and_then(|v| v.as_array()) {
        for class in classes {
            if let Some(name) = class.as_str() {
                ctx.class_put_hard(name, None);
            }
        }
    }

    tracing::info!(file = %path.display(), "augments applied");
    Ok(())
}

/// Read still-valid persistent classes from the classes database; expired
/// entries are removed on the way through.
fn load_persistent_classes(ctx: &mut EvalContext, state: &EngineState) {
    let now = state.now();
    let db = match state.stores.open(DbId::Classes) {
        Ok(db) => db,
        Err(e) => {
            tracing::warn!(error = %e, "persistent classes unavailable");
            return;
        }
    };

    let mut cursor = match db.cursor() {
        Ok(cursor) => cursor,
        Err(e) => {
            tracing::warn!(error = %e, "persistent class scan failed");
            return;
        }
    };

    let mut loaded = 0usize;
    while let Some((_, value)) = cursor.advance() {
        let record: PersistentClass = match serde_json::from_slice(value) {
            Ok(record) => record,
            Err(_) => continue,
        };
        if record.is_expired(now) {
            let _ = cursor.delete_current();
        } else {
            ctx.class_put_hard(&record.name, Some(record.expires_at));
            loaded += 1;
        }
    }
    if let Err(e) = cursor.close() {
        tracing::warn!(error = %e, "persistent class cleanup failed");
    }
    tracing::debug!(loaded, "persistent classes loaded");
}

/// Write the persistent classes queued during the run.
fn flush_persistent_classes(ctx: &mut EvalContext, state: &EngineState) {
    let pending = ctx.take_pending_persistent();
    if pending.is_empty() {
        return;
    }
    let db = match state.stores.open(DbId::Classes) {
        Ok(db) => db,
        Err(e) => {
            tracing::warn!(error = %e, "persistent classes not flushed");
            return;
        }
    };
    for (record, _policy) in pending {
        match serde_json::to_vec(&record) {
            Ok(bytes) => {
                if let Err(e) = db.write(&string_key(&record.name), &bytes) {
                    tracing::warn!(class = %record.name, error = %e, "persistent class write failed");
                }
            }
            Err(e) => tracing::warn!(class = %record.name, error = %e, "persistent class encode failed"),
        }
    }
}

/// The built-in policy used when the real inputs are missing or broken, so
/// a daemon keeps running and reporting instead of dying.
pub fn failsafe_policy() -> Policy {
    let mut bundle = accord_core::Bundle::new("failsafe", accord_core::BundleType::Agent);
    let mut promise = accord_core::Promise::new(
        "policy inputs are missing or unparsable, running failsafe",
    );
    promise.location = accord_core::SourceLocation::new("<builtin>", 1);
    bundle.sections.push(accord_core::Section {
        promise_type: accord_core::PromiseType::Reports,
        promises: vec![promise],
    });
    Policy {
        bundles: vec![bundle],
        bodies: Vec::new(),
    }
}
