//! Promise dispatcher
//!
//! Applies class guards, normalises bodies into the working promise copy,
//! drives the iteration cross-product, and hands each fully-expanded copy to
//! the actuator registered for its promise type. Convergence is fixed-point
//! by repeated passes: up to three walks over the bundle sequence, stopping
//! early when a pass defines no new classes and repairs nothing.

use accord_core::{
    canonify, AccordResult, Bundle, Constraint, EvalError, Outcome, OutcomeTally, Policy, Promise,
    PromiseType, Rval,
};

use crate::actuators::ActuatorTable;
use crate::context::{EvalContext, FrameKind};
use crate::expand;
use crate::iterate::PromiseIterator;
use crate::state::EngineState;
use crate::term::pending_termination;

/// Maximum convergence passes over the bundle sequence.
const MAX_PASSES: usize = 3;

/// Pre-evaluation passes over `vars`/`classes` sections of common bundles.
/// The second pass resolves definitions that depend on first-pass results.
const PRE_EVAL_PASSES: usize = 2;

/// Walk the bundle sequence to a fixed point.
pub fn run_policy(
    state: &EngineState,
    ctx: &mut EvalContext,
    policy: &Policy,
    actuators: &ActuatorTable,
    sequence: Option<&[String]>,
) -> AccordResult<OutcomeTally> {
    let bundles = policy.bundle_sequence(sequence);
    let mut tally = OutcomeTally::default();

    // Pre-evaluate common bundles so their vars and classes exist before
    // any agent bundle runs.
    for _ in 0..PRE_EVAL_PASSES {
        for bundle in &bundles {
            if bundle.bundle_type == accord_core::BundleType::Common {
                eval_bundle_filtered(
                    state,
                    ctx,
                    policy,
                    bundle,
                    actuators,
                    Some(&[PromiseType::Vars, PromiseType::Classes]),
                    None,
                    &mut OutcomeTally::default(),
                )?;
            }
        }
    }

    let mut class_watermark = ctx.class_count();
    for pass in 0..MAX_PASSES {
        let mut repaired = false;
        for bundle in &bundles {
            let outcome =
                eval_bundle_filtered(state, ctx, policy, bundle, actuators, None, None, &mut tally)?;
            repaired |= outcome.is_change();
            if pending_termination() {
                tracing::info!("termination pending, abandoning bundle walk");
                return Ok(tally);
            }
        }
        let classes_now = ctx.class_count();
        tracing::debug!(pass, classes = classes_now, repaired, "bundle pass complete");
        if !repaired && classes_now == class_watermark {
            break;
        }
        class_watermark = classes_now;
    }

    Ok(tally)
}

/// Evaluate one bundle, optionally restricted to certain promise types,
/// optionally with positional arguments bound to its parameters.
#[allow(clippy::too_many_arguments)]
pub fn eval_bundle_filtered(
    state: &EngineState,
    ctx: &mut EvalContext,
    policy: &Policy,
    bundle: &Bundle,
    actuators: &ActuatorTable,
    only: Option<&[PromiseType]>,
    args: Option<&[Rval]>,
    tally: &mut OutcomeTally,
) -> AccordResult<Outcome> {
    ctx.push_frame(FrameKind::Bundle, &bundle.namespace, &bundle.name);

    if let Some(args) = args {
        for (param, arg) in bundle.params.iter().zip(args) {
            let r = accord_core::VarRef {
                namespace: Some(bundle.namespace.clone()),
                scope: Some(bundle.name.clone()),
                name: param.clone(),
                indices: Vec::new(),
            };
            let var_type = match arg {
                Rval::List(_) => accord_core::VarType::Slist,
                Rval::Container(_) => accord_core::VarType::Container,
                _ => accord_core::VarType::String,
            };
            ctx.variable_put(&r, arg.clone(), var_type, vec!["source=bundle_param".into()])?;
        }
    }

    let mut aggregate = Outcome::Kept;
    'sections: for section in bundle.sections_in_normal_order() {
        if let Some(only) = only {
            if !only.contains(&section.promise_type) {
                continue;
            }
        }
        ctx.push_frame(FrameKind::BundleSection, &bundle.namespace, &bundle.name);
        for promise in &section.promises {
            let outcome = dispatch_promise(
                state,
                ctx,
                policy,
                bundle,
                section.promise_type,
                promise,
                actuators,
                tally,
            )?;
            tally.record(outcome);
            aggregate = aggregate.worst(outcome);
            if pending_termination() {
                ctx.pop_frame(FrameKind::BundleSection)?;
                break 'sections;
            }
        }
        ctx.pop_frame(FrameKind::BundleSection)?;
    }

    ctx.pop_frame(FrameKind::Bundle)?;
    Ok(aggregate)
}

/// Dispatch one promise: guard, copy, iterate, expand, actuate.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_promise(
    state: &EngineState,
    ctx: &mut EvalContext,
    policy: &Policy,
    bundle: &Bundle,
    promise_type: PromiseType,
    promise: &Promise,
    actuators: &ActuatorTable,
    tally: &mut OutcomeTally,
) -> AccordResult<Outcome> {
    let now = state.now();
    let ns = bundle.namespace.clone();
    let scope = bundle.name.clone();

    // Guards carrying references cannot be decided yet; they are evaluated
    // per iteration after expansion.
    if !promise.guard.contains('$') {
        match ctx.class_is_defined(&promise.guard, now) {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(promiser = %promise.promiser, guard = %promise.guard, "guard undefined, skipping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => {
                tracing::error!(promiser = %promise.promiser, error = %e, "invalid class guard");
                return Ok(Outcome::Fail);
            }
        }
    }

    // Working copy with bodies inlined; the declared promise stays immutable.
    let mut copy = promise.clone();
    if let Err(e) = inline_bodies(policy, &mut copy) {
        tracing::error!(promiser = %promise.promiser, error = %e, "body resolution failed");
        return Ok(Outcome::Fail);
    }

    let handle = copy
        .constraint("handle")
        .and_then(|r| r.as_scalar())
        .map(canonify)
        .unwrap_or_else(|| canonify(&format!("{}_{}", copy.location.file, copy.location.line)));

    ctx.push_frame(FrameKind::Promise, &ns, &scope);
    let mut iter = PromiseIterator::prepare(ctx, &ns, &scope, &mut copy, &state.functions, now);

    let mut aggregate: Option<Outcome> = None;
    if iter.has_empty_wheel() {
        // An empty list suppresses the promise, except that `ifelse` must
        // still run once to supply its fallback. Documented oddity of the
        // original engine; tests pin the observable behaviour.
        if copy.calls_function("ifelse") {
            let outcome = run_iteration(
                state, ctx, policy, bundle, promise_type, &copy, &handle, &[], actuators, tally,
            )?;
            aggregate = Some(outcome);
        } else {
            aggregate = Some(Outcome::Skipped);
        }
    } else {
        while iter.next(ctx) {
            let bindings = iter.bindings();
            let outcome = run_iteration(
                state,
                ctx,
                policy,
                bundle,
                promise_type,
                &copy,
                &handle,
                &bindings,
                actuators,
                tally,
            )?;
            aggregate = Some(aggregate.map_or(outcome, |a| a.worst(outcome)));
            if pending_termination() {
                break;
            }
        }
    }

    ctx.clear_iteration_bindings();
    ctx.pop_frame(FrameKind::Promise)?;
    Ok(aggregate.unwrap_or(Outcome::Skipped))
}

/// One iteration step: push the iteration frame, repopulate `this`, expand
/// the copy, and call the actuator.
#[allow(clippy::too_many_arguments)]
fn run_iteration(
    state: &EngineState,
    ctx: &mut EvalContext,
    policy: &Policy,
    bundle: &Bundle,
    promise_type: PromiseType,
    copy: &Promise,
    handle: &str,
    bindings: &[(String, Rval)],
    actuators: &ActuatorTable,
    tally: &mut OutcomeTally,
) -> AccordResult<Outcome> {
    let now = state.now();
    let ns = &bundle.namespace;
    let scope = &bundle.name;

    ctx.push_frame(FrameKind::PromiseIteration, ns, scope);
    ctx.clear_this();

    let expanded_promiser = expand::expand_scalar(ctx, ns, scope, &copy.promiser);
    ctx.set_this("promiser", Rval::scalar(expanded_promiser.clone()));
    ctx.set_this("promise_filename", Rval::scalar(copy.location.file.clone()));
    ctx.set_this(
        "promise_dirname",
        Rval::scalar(dirname(&copy.location.file)),
    );
    ctx.set_this("handle", Rval::scalar(handle));
    for (name, value) in bindings {
        ctx.set_this(name, value.clone());
    }

    let result = (|| -> AccordResult<Outcome> {
        let expanded = match expand_promise(ctx, ns, scope, copy, state, now) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(promiser = %copy.promiser, error = %e, "expansion failed");
                return Ok(Outcome::Fail);
            }
        };

        // Guards can carry references; a post-expansion guard that does not
        // hold skips just this iteration. Expansion above already ran, so
        // function side effects happen either way.
        if copy.guard.contains('$') {
            let guard = expand::expand_scalar(ctx, ns, scope, &copy.guard);
            if !ctx.class_is_defined(&guard, now).unwrap_or(false) {
                return Ok(Outcome::Skipped);
            }
        }

        if promise_type == PromiseType::Methods {
            return run_method(state, ctx, policy, &expanded, actuators, tally);
        }

        let actuator = match actuators.get(promise_type) {
            Some(actuator) => actuator,
            None => {
                tracing::trace!(promise_type = %promise_type, "no actuator registered");
                return Ok(Outcome::Skipped);
            }
        };

        let mut outcome = actuator.actuate(state, ctx, &expanded, now)?;

        // Variables run at double rate: re-expand and re-actuate so peers in
        // the same pass see what this promise just defined.
        if promise_type.is_double_rate() {
            if let Ok(again) = expand_promise(ctx, ns, scope, copy, state, now) {
                outcome = outcome.worst(actuator.actuate(state, ctx, &again, now)?);
            }
        }

        Ok(outcome)
    })();

    ctx.pop_frame(FrameKind::PromiseIteration)?;
    result
}

/// Expand promiser, promisee and every constraint of a promise copy.
fn expand_promise(
    ctx: &EvalContext,
    ns: &str,
    scope: &str,
    copy: &Promise,
    state: &EngineState,
    now: i64,
) -> Result<Promise, EvalError> {
    let mut expanded = copy.clone();
    expanded.promiser = expand::expand_scalar(ctx, ns, scope, &copy.promiser);
    if let Some(promisee) = &copy.promisee {
        expanded.promisee = Some(expand::expand_rval(
            ctx,
            ns,
            scope,
            promisee,
            &state.functions,
            now,
        )?);
    }
    for constraint in &mut expanded.constraints {
        // `usebundle => b(args)` names a bundle, not a function; only its
        // arguments expand.
        if constraint.lval == "usebundle" {
            if let Rval::FnCall(call) = &constraint.rval {
                let mut args = Vec::with_capacity(call.args.len());
                for arg in &call.args {
                    args.push(expand::expand_rval(
                        ctx,
                        ns,
                        scope,
                        arg,
                        &state.functions,
                        now,
                    )?);
                }
                constraint.rval =
                    Rval::FnCall(accord_core::FnCall::new(call.name.clone(), args));
                continue;
            }
        }
        constraint.rval =
            expand::expand_rval(ctx, ns, scope, &constraint.rval, &state.functions, now)?;
    }
    Ok(expanded)
}

/// `methods:` promises evaluate another bundle in a child frame, with
/// arguments bound to its parameters.
fn run_method(
    state: &EngineState,
    ctx: &mut EvalContext,
    policy: &Policy,
    promise: &Promise,
    actuators: &ActuatorTable,
    tally: &mut OutcomeTally,
) -> AccordResult<Outcome> {
    let (name, args) = match promise.constraint("usebundle") {
        Some(Rval::Scalar(name)) => (name.clone(), Vec::new()),
        Some(Rval::FnCall(call)) => (call.name.clone(), call.args.clone()),
        _ => {
            tracing::warn!(promiser = %promise.promiser, "methods promise without usebundle");
            return Ok(Outcome::Skipped);
        }
    };

    let namespace = ctx.current_namespace();
    let target = match policy.bundle(&namespace, &name) {
        Some(bundle) => bundle,
        None => {
            tracing::error!(bundle = %name, "usebundle names an unknown bundle");
            return Ok(Outcome::Fail);
        }
    };

    eval_bundle_filtered(
        state,
        ctx,
        policy,
        target,
        actuators,
        None,
        Some(&args),
        tally,
    )
}

/// Replace body references (`action => quick`, `perms => m("600")`) with
/// the body's resolved constraints. Attributes the promise sets explicitly
/// win over inherited ones.
fn inline_bodies(policy: &Policy, promise: &mut Promise) -> Result<(), accord_core::PolicyError> {
    let mut inlined: Vec<Constraint> = Vec::new();
    let mut kept: Vec<Constraint> = Vec::new();

    for constraint in promise.constraints.drain(..) {
        let reference = match &constraint.rval {
            Rval::Scalar(name) => Some((name.clone(), Vec::new())),
            Rval::FnCall(call) => Some((call.name.clone(), call.args.clone())),
            _ => None,
        };

        let resolved = reference.and_then(|(name, args)| {
            policy
                .body(&constraint.lval, &name)
                .map(|body| (body, name, args))
        });

        match resolved {
            Some((body, name, args)) => {
                let merged = policy.resolve_body_constraints(&constraint.lval, &name)?;
                let params: Vec<(String, String)> = body
                    .params
                    .iter()
                    .cloned()
                    .zip(args.iter().map(rval_text))
                    .collect();
                for mut inner in merged {
                    if let Rval::Scalar(text) = &inner.rval {
                        inner.rval = Rval::Scalar(substitute_params(text, &params));
                    }
                    inlined.push(inner);
                }
            }
            None => kept.push(constraint),
        }
    }

    // Explicit promise attributes override body-provided ones.
    for constraint in inlined {
        if !kept.iter().any(|c| c.lval == constraint.lval) {
            kept.push(constraint);
        }
    }
    promise.constraints = kept;
    Ok(())
}

fn substitute_params(text: &str, params: &[(String, String)]) -> String {
    let mut out = text.to_string();
    for (param, arg) in params {
        out = out.replace(&format!("$({})", param), arg);
        out = out.replace(&format!("${{{}}}", param), arg);
    }
    out
}

fn rval_text(rval: &Rval) -> String {
    match rval {
        Rval::Scalar(s) => s.clone(),
        other => other.to_string(),
    }
}

fn dirname(path: &str) -> String {
    std::path::Path::new(path)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::Actuator;
    use accord_core::{AgentConfig, BundleType, FnCall, Section, VarType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Test actuator that records every promiser it is asked to actuate.
    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        outcome: Outcome,
    }

    impl Actuator for Recording {
        fn actuate(
            &self,
            _state: &EngineState,
            _ctx: &mut EvalContext,
            promise: &Promise,
            _now: i64,
        ) -> AccordResult<Outcome> {
            self.log
                .lock()
                .expect("lock should succeed")
                .push(promise.promiser.clone());
            Ok(self.outcome)
        }
    }

    fn fixture() -> (EngineState, EvalContext, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let state = EngineState::new(AgentConfig::default().with_workdir(tmp.path()))
            .expect("state should build");
        let ctx = EvalContext::new();
        (state, ctx, tmp)
    }

    fn recording_table(log: Arc<Mutex<Vec<String>>>, outcome: Outcome) -> ActuatorTable {
        let mut table = ActuatorTable::empty();
        table.register(PromiseType::Reports, Box::new(Recording { log, outcome }));
        table
    }

    fn bundle_with_reports(promises: Vec<Promise>) -> Bundle {
        let mut bundle = Bundle::new("main", BundleType::Agent);
        bundle.sections.push(Section {
            promise_type: PromiseType::Reports,
            promises,
        });
        bundle
    }

    #[test]
    fn test_guard_short_circuit_skips_actuation() {
        let (state, mut ctx, _tmp) = fixture();
        ctx.class_put_hard("A", None);
        ctx.class_put_hard("B", None);

        let log = Arc::new(Mutex::new(Vec::new()));
        let table = recording_table(Arc::clone(&log), Outcome::Kept);

        let mut promise = Promise::new("guarded");
        promise.guard = "A.!B".to_string();
        let bundle = bundle_with_reports(vec![promise.clone()]);
        let policy = Policy::new();
        let mut tally = OutcomeTally::default();

        let outcome = dispatch_promise(
            &state,
            &mut ctx,
            &policy,
            &bundle,
            PromiseType::Reports,
            &promise,
            &table,
            &mut tally,
        )
        .expect("dispatch should succeed");
        assert_eq!(outcome, Outcome::Skipped);
        assert!(log.lock().expect("lock should succeed").is_empty());
    }

    #[test]
    fn test_invalid_guard_fails_promise() {
        let (state, mut ctx, _tmp) = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let table = recording_table(Arc::clone(&log), Outcome::Kept);

        let mut promise = Promise::new("broken");
        promise.guard = "(((".to_string();
        let bundle = bundle_with_reports(vec![promise.clone()]);
        let mut tally = OutcomeTally::default();

        let outcome = dispatch_promise(
            &state,
            &mut ctx,
            &Policy::new(),
            &bundle,
            PromiseType::Reports,
            &promise,
            &table,
            &mut tally,
        )
        .expect("dispatch should succeed");
        assert_eq!(outcome, Outcome::Fail);
    }

    #[test]
    fn test_iteration_guard_skip_still_runs_functions() {
        // Expansion evaluates functions eagerly before the post-expansion
        // guard is consulted; side effects must not depend on the guard.
        let (mut state, mut ctx, _tmp) = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_fn = Arc::clone(&calls);
        state.functions.register(
            "observe",
            0,
            0,
            crate::functions::FnKind::Scalar,
            Box::new(move |_fn_ctx, _args| {
                calls_in_fn.fetch_add(1, Ordering::SeqCst);
                Ok(Rval::scalar("seen"))
            }),
        );

        ctx.push_frame(FrameKind::Bundle, "default", "main");
        ctx.variable_put(
            &accord_core::VarRef::parse("mode"),
            Rval::scalar("off"),
            VarType::String,
            vec![],
        )
        .expect("put should succeed");
        ctx.pop_frame(FrameKind::Bundle).expect("pop should succeed");

        let log = Arc::new(Mutex::new(Vec::new()));
        let table = recording_table(Arc::clone(&log), Outcome::Kept);

        let mut promise = Promise::new("conditional");
        // Expands to `switch_off`, which is undefined.
        promise.guard = "switch_$(main.mode)".to_string();
        promise.constraints.push(Constraint::new(
            "comment",
            Rval::FnCall(FnCall::new("observe", vec![])),
        ));
        let bundle = bundle_with_reports(vec![promise.clone()]);
        let mut tally = OutcomeTally::default();

        let outcome = dispatch_promise(
            &state,
            &mut ctx,
            &Policy::new(),
            &bundle,
            PromiseType::Reports,
            &promise,
            &table,
            &mut tally,
        )
        .expect("dispatch should succeed");

        assert_eq!(outcome, Outcome::Skipped);
        assert!(log.lock().expect("lock should succeed").is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "function ran despite skip");
    }

    #[test]
    fn test_iteration_fires_per_element_in_order() {
        let (state, mut ctx, _tmp) = fixture();
        ctx.push_frame(FrameKind::Bundle, "default", "main");
        ctx.variable_put(
            &accord_core::VarRef::parse("l"),
            Rval::slist(["a", "b", "c"]),
            VarType::Slist,
            vec![],
        )
        .expect("put should succeed");
        ctx.pop_frame(FrameKind::Bundle).expect("pop should succeed");

        let log = Arc::new(Mutex::new(Vec::new()));
        let table = recording_table(Arc::clone(&log), Outcome::Kept);

        let promise = Promise::new("/tmp/$(main.l)");
        let bundle = bundle_with_reports(vec![promise.clone()]);
        let mut tally = OutcomeTally::default();

        dispatch_promise(
            &state,
            &mut ctx,
            &Policy::new(),
            &bundle,
            PromiseType::Reports,
            &promise,
            &table,
            &mut tally,
        )
        .expect("dispatch should succeed");

        assert_eq!(
            log.lock().expect("lock should succeed").as_slice(),
            ["/tmp/a", "/tmp/b", "/tmp/c"]
        );
    }

    #[test]
    fn test_empty_list_suppresses_unless_ifelse() {
        let (state, mut ctx, _tmp) = fixture();
        ctx.push_frame(FrameKind::Bundle, "default", "main");
        ctx.variable_put(
            &accord_core::VarRef::parse("none"),
            Rval::List(vec![]),
            VarType::Slist,
            vec![],
        )
        .expect("put should succeed");
        ctx.pop_frame(FrameKind::Bundle).expect("pop should succeed");

        let log = Arc::new(Mutex::new(Vec::new()));
        let table = recording_table(Arc::clone(&log), Outcome::Kept);
        let bundle = Bundle::new("main", BundleType::Agent);
        let mut tally = OutcomeTally::default();

        // Plain promise over the empty list: suppressed.
        let plain = Promise::new("x_$(main.none)");
        let outcome = dispatch_promise(
            &state,
            &mut ctx,
            &Policy::new(),
            &bundle,
            PromiseType::Reports,
            &plain,
            &table,
            &mut tally,
        )
        .expect("dispatch should succeed");
        assert_eq!(outcome, Outcome::Skipped);
        assert!(log.lock().expect("lock should succeed").is_empty());

        // The same shape with ifelse in a constraint still fires once.
        let mut with_fallback = Promise::new("y_$(main.none)");
        with_fallback.constraints.push(Constraint::new(
            "comment",
            Rval::FnCall(FnCall::new(
                "ifelse",
                vec![Rval::scalar("fallback")],
            )),
        ));
        dispatch_promise(
            &state,
            &mut ctx,
            &Policy::new(),
            &bundle,
            PromiseType::Reports,
            &with_fallback,
            &table,
            &mut tally,
        )
        .expect("dispatch should succeed");
        assert_eq!(log.lock().expect("lock should succeed").len(), 1);
    }

    #[test]
    fn test_methods_evaluates_bundle_with_params() {
        let (state, mut ctx, _tmp) = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let table = recording_table(Arc::clone(&log), Outcome::Kept);

        let mut callee = Bundle::new("greet", BundleType::Agent);
        callee.params = vec!["who".to_string()];
        callee.sections.push(Section {
            promise_type: PromiseType::Reports,
            promises: vec![Promise::new("hello $(greet.who)")],
        });

        let mut caller = Bundle::new("main", BundleType::Agent);
        let mut method = Promise::new("run greeting");
        method.constraints.push(Constraint::new(
            "usebundle",
            Rval::FnCall(FnCall::new("greet", vec![Rval::scalar("dot")])),
        ));
        caller.sections.push(Section {
            promise_type: PromiseType::Methods,
            promises: vec![method.clone()],
        });

        let policy = Policy {
            bundles: vec![caller.clone(), callee],
            bodies: Vec::new(),
        };
        let mut tally = OutcomeTally::default();

        dispatch_promise(
            &state,
            &mut ctx,
            &policy,
            &caller,
            PromiseType::Methods,
            &method,
            &table,
            &mut tally,
        )
        .expect("dispatch should succeed");

        assert_eq!(
            log.lock().expect("lock should succeed").as_slice(),
            ["hello dot"]
        );
    }

    #[test]
    fn test_convergence_second_pass_sees_new_classes() {
        let (state, mut ctx, _tmp) = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = recording_table(Arc::clone(&log), Outcome::Kept);
        table.register(
            PromiseType::Classes,
            Box::new(crate::actuators::ClassesActuator),
        );

        // First bundle reports only under `flag`; second bundle defines it
        // namespace-wide. Pass two picks the report up.
        let mut guarded = Promise::new("late report");
        guarded.guard = "flag".to_string();
        let reporter = bundle_with_reports(vec![guarded]);

        let mut definer = Bundle::new("definer", BundleType::Agent);
        let mut classes_promise = Promise::new("flag");
        classes_promise
            .constraints
            .push(Constraint::new("expression", Rval::scalar("any")));
        classes_promise
            .constraints
            .push(Constraint::new("scope", Rval::scalar("namespace")));
        definer.sections.push(Section {
            promise_type: PromiseType::Classes,
            promises: vec![classes_promise],
        });

        let policy = Policy {
            bundles: vec![reporter, definer],
            bodies: Vec::new(),
        };

        run_policy(&state, &mut ctx, &policy, &table, None)
            .expect("run should succeed");

        assert_eq!(
            log.lock().expect("lock should succeed").as_slice(),
            ["late report"]
        );
    }
}
