//! Iteration engine
//!
//! Before a promise expands, every reference in its rvalues is inspected;
//! references that resolve to a list or container add a wheel to the
//! promise's iterator. `next` advances the wheels in odometer order - the
//! first wheel registered is outermost, the last innermost - and publishes
//! the current element of each wheel as an iteration binding in the context.
//!
//! An empty wheel suppresses the whole promise. An unresolvable reference
//! adds no wheel. A function call that evaluates to a list becomes a wheel
//! on the fly: the constraint is rewritten to reference a synthetic name
//! bound per step.

use accord_core::{FnCall, Promise, Rval};

use crate::context::EvalContext;
use crate::expand;
use crate::functions::{is_map_family, FunctionTable};

/// One axis of the cross product.
struct Wheel {
    /// The reference text as written, e.g. `l` or `deps.packages`.
    ref_text: String,
    ticks: Vec<Rval>,
    pos: usize,
}

/// Cross-product iterator over one promise's list references.
pub struct PromiseIterator {
    wheels: Vec<Wheel>,
    started: bool,
    finished: bool,
}

impl PromiseIterator {
    /// Inspect `promise` and register a wheel per iterable reference. May
    /// rewrite function-call constraints in place to synthetic references
    /// when the call already evaluates to a list.
    pub fn prepare(
        ctx: &EvalContext,
        ns: &str,
        scope: &str,
        promise: &mut Promise,
        funcs: &FunctionTable,
        now: i64,
    ) -> Self {
        let mut refs: Vec<String> = Vec::new();
        collect_refs_in_scalar(&promise.promiser, &mut refs);
        if let Some(promisee) = &promise.promisee {
            collect_refs(promisee, &mut refs);
        }
        for constraint in &promise.constraints {
            collect_refs(&constraint.rval, &mut refs);
        }

        let mut wheels = Vec::new();
        for ref_text in refs {
            if wheels.iter().any(|w: &Wheel| w.ref_text == ref_text) {
                // Multiple references to one list share a single wheel, so
                // they see the same index at every step.
                continue;
            }
            if let Some(ticks) = resolve_iterable(ctx, ns, scope, &ref_text) {
                wheels.push(Wheel {
                    ref_text,
                    ticks,
                    pos: 0,
                });
            }
        }

        // Function calls declared to return a list iterate like one: swap
        // the call for a synthetic reference and give it a wheel.
        for constraint in &mut promise.constraints {
            if let Rval::FnCall(call) = &constraint.rval {
                if is_map_family(&call.name) || !funcs.returns_list(&call.name) {
                    continue;
                }
                if let Ok(Rval::List(items)) =
                    expand::expand_rval(ctx, ns, scope, &constraint.rval, funcs, now)
                {
                    if list_shaped_lval(&constraint.lval) {
                        continue; // list-valued attributes keep the whole list
                    }
                    let synthetic = format!("__fn_{}", constraint.lval);
                    constraint.rval = Rval::Scalar(format!("$({})", synthetic));
                    wheels.push(Wheel {
                        ref_text: synthetic,
                        ticks: items,
                        pos: 0,
                    });
                }
            }
        }

        Self {
            wheels,
            started: false,
            finished: false,
        }
    }

    /// An iterator with no wheels still fires exactly once.
    pub fn has_wheels(&self) -> bool {
        !self.wheels.is_empty()
    }

    /// True when some referenced list has no elements; the promise is
    /// suppressed entirely.
    pub fn has_empty_wheel(&self) -> bool {
        self.wheels.iter().any(|w| w.ticks.is_empty())
    }

    /// Advance to the next tuple, publishing bindings into `ctx`. Returns
    /// false when the product is exhausted (or empty).
    pub fn next(&mut self, ctx: &mut EvalContext) -> bool {
        if self.finished || self.has_empty_wheel() {
            self.finished = true;
            return false;
        }

        if !self.started {
            self.started = true;
            self.publish(ctx);
            return true;
        }

        if self.wheels.is_empty() {
            self.finished = true;
            return false;
        }

        // Odometer: the innermost (last-registered) wheel spins fastest.
        let mut i = self.wheels.len();
        loop {
            if i == 0 {
                self.finished = true;
                return false;
            }
            i -= 1;
            self.wheels[i].pos += 1;
            if self.wheels[i].pos < self.wheels[i].ticks.len() {
                break;
            }
            self.wheels[i].pos = 0;
        }

        self.publish(ctx);
        true
    }

    /// The current element of every wheel, outermost first.
    pub fn bindings(&self) -> Vec<(String, Rval)> {
        self.wheels
            .iter()
            .filter_map(|w| {
                w.ticks
                    .get(w.pos)
                    .map(|tick| (w.ref_text.clone(), tick.clone()))
            })
            .collect()
    }

    fn publish(&self, ctx: &mut EvalContext) {
        for (ref_text, value) in self.bindings() {
            ctx.set_iteration_binding(&ref_text, value);
        }
    }
}

/// Resolve a reference to its tick values when it names a list or
/// container.
fn resolve_iterable(
    ctx: &EvalContext,
    ns: &str,
    scope: &str,
    ref_text: &str,
) -> Option<Vec<Rval>> {
    let r = accord_core::VarRef::parse(ref_text);
    let (value, _) = ctx
        .variable_get(&r)
        .or_else(|| {
            if r.scope.is_none() && !scope.is_empty() {
                ctx.variable_get(&r.qualify(ns, scope))
            } else {
                None
            }
        })?;
    match value {
        Rval::List(items) => Some(items),
        Rval::Container(serde_json::Value::Array(items)) => {
            Some(items.into_iter().map(Rval::Container).collect())
        }
        Rval::Container(serde_json::Value::Object(map)) => {
            Some(map.keys().map(|k| Rval::scalar(k.clone())).collect())
        }
        _ => None,
    }
}

/// Attributes that expect a list keep function results whole instead of
/// iterating over them.
fn list_shaped_lval(lval: &str) -> bool {
    matches!(lval, "slist" | "rlist" | "depends_on")
}

/// Collect reference bodies (`$(x)`, `${x}`, `@(x)`, `@{x}`) at every
/// nesting level, in order of appearance.
fn collect_refs(rval: &Rval, out: &mut Vec<String>) {
    match rval {
        Rval::Scalar(s) => collect_refs_in_scalar(s, out),
        Rval::List(items) => {
            for item in items {
                collect_refs(item, out);
            }
        }
        Rval::FnCall(call) => collect_refs_in_fncall(call, out),
        Rval::Container(_) | Rval::Empty => {}
    }
}

fn collect_refs_in_fncall(call: &FnCall, out: &mut Vec<String>) {
    // Map-family arguments keep their `$(this)` placeholders; discovering
    // iterators inside them would break the inner binding order.
    if is_map_family(&call.name) {
        return;
    }
    for arg in &call.args {
        collect_refs(arg, out);
    }
}

fn collect_refs_in_scalar(s: &str, out: &mut Vec<String>) {
    let bytes = s.as_bytes();
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if matches!(bytes[i], b'$' | b'@') && matches!(bytes[i + 1], b'(' | b'{') {
            let open = bytes[i + 1];
            let close = if open == b'(' { b')' } else { b'}' };
            if let Some(end) = matching_close(bytes, i + 1, open, close) {
                let body = &s[i + 2..end];
                out.push(body.to_string());
                // Nested references iterate too.
                collect_refs_in_scalar(body, out);
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
}

fn matching_close(bytes: &[u8], open_at: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(open_at) {
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}
