//! Expansion engine
//!
//! Rewrites textual rvalues against the evaluation context: `$(x)`/`${x}`
//! references become variable values, naked `@(x)` entries inline lists, and
//! function calls are applied through the built-in table.
//!
//! Function calls are evaluated eagerly during expansion, once per
//! iteration, even when the surrounding promise will be skipped by its class
//! guard. Side-effecting functions must run so the classes they define are
//! visible to later promises; the guard is enforced at the dispatcher, not
//! here.

use accord_core::{naked_reference_body, EvalError, FnCall, Rval, VarRef, VarType};

use crate::context::EvalContext;
use crate::functions::{FnCtx, FunctionTable};

/// Nested references expand depth-first up to this many levels; beyond it
/// the text is left verbatim for a later pass.
const MAX_EXPANSION_DEPTH: usize = 12;

/// Expand every `$(r)` / `${r}` reference in a scalar. Unresolvable
/// references are preserved verbatim so later passes can retry them.
pub fn expand_scalar(ctx: &EvalContext, ns: &str, scope: &str, input: &str) -> String {
    expand_scalar_depth(ctx, ns, scope, input, 0)
}

fn expand_scalar_depth(
    ctx: &EvalContext,
    ns: &str,
    scope: &str,
    input: &str,
    depth: usize,
) -> String {
    if depth > MAX_EXPANSION_DEPTH {
        return input.to_string();
    }

    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && matches!(bytes[i + 1], b'(' | b'{') {
            let open = bytes[i + 1];
            let close = if open == b'(' { b')' } else { b'}' };
            match matching_close(bytes, i + 1, open, close) {
                Some(end) => {
                    let raw_inner = &input[i + 2..end];
                    // Depth-first: inner references resolve before the outer
                    // lookup.
                    let inner = expand_scalar_depth(ctx, ns, scope, raw_inner, depth + 1);
                    match resolve_scalar(ctx, ns, scope, &inner) {
                        Some(text) => {
                            out.push_str(&expand_scalar_depth(ctx, ns, scope, &text, depth + 1))
                        }
                        None => out.push_str(&input[i..=end]),
                    }
                    i = end + 1;
                }
                None => {
                    out.push(input[i..].chars().next().unwrap_or('$'));
                    i += 1;
                }
            }
        } else {
            match input[i..].chars().next() {
                Some(c) => {
                    out.push(c);
                    i += c.len_utf8();
                }
                None => break,
            }
        }
    }

    out
}

/// Resolve a reference body to scalar text, or `None` to leave it verbatim.
fn resolve_scalar(ctx: &EvalContext, ns: &str, scope: &str, body: &str) -> Option<String> {
    // The current iteration element for a discovered list wins.
    if let Some(binding) = ctx.iteration_binding(body) {
        return rval_as_scalar_text(binding);
    }

    let (value, _) = lookup(ctx, ns, scope, body)?;
    rval_as_scalar_text(&value)
}

fn lookup(ctx: &EvalContext, ns: &str, scope: &str, body: &str) -> Option<(Rval, VarType)> {
    let r = VarRef::parse(body);
    if let Some(found) = ctx.variable_get(&r) {
        return Some(found);
    }
    if r.scope.is_none() && !scope.is_empty() {
        return ctx.variable_get(&r.qualify(ns, scope));
    }
    None
}

/// Stringify an rvalue for scalar substitution. Lists and non-primitive
/// containers refuse, which leaves the reference intact.
fn rval_as_scalar_text(rval: &Rval) -> Option<String> {
    match rval {
        Rval::Scalar(s) => Some(s.clone()),
        Rval::Container(value) => match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Null => Some("null".to_string()),
            _ => None,
        },
        _ => None,
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

/// Expand a whole rvalue.
pub fn expand_rval(
    ctx: &EvalContext,
    ns: &str,
    scope: &str,
    rval: &Rval,
    funcs: &FunctionTable,
    now: i64,
) -> Result<Rval, EvalError> {
    match rval {
        Rval::Scalar(s) => {
            // Data-or-list dereference: a scalar that is exactly `@(ref)` is
            // re-interpreted as an rvalue reference after scalar expansion,
            // which is what makes `@($(name))` behave as dereference.
            if s.starts_with('@') {
                if let Some(body) = naked_reference_body(s) {
                    let inner = expand_scalar(ctx, ns, scope, body);
                    return Ok(match lookup(ctx, ns, scope, &inner) {
                        Some((Rval::List(items), _)) => Rval::List(items),
                        Some((Rval::Container(value), _)) => Rval::Container(value),
                        _ => Rval::Scalar(s.clone()),
                    });
                }
            }
            Ok(Rval::Scalar(expand_scalar(ctx, ns, scope, s)))
        }

        Rval::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                // Naked `@(x)` / `${x}` entries inline into the parent list
                // when they resolve to one.
                if let Some(spliced) = naked_list_elements(ctx, ns, scope, item) {
                    for element in spliced {
                        out.push(expand_rval(ctx, ns, scope, &element, funcs, now)?);
                    }
                    continue;
                }
                out.push(expand_rval(ctx, ns, scope, item, funcs, now)?);
            }
            Ok(Rval::List(out))
        }

        Rval::FnCall(call) => expand_fncall(ctx, ns, scope, call, funcs, now),

        Rval::Container(value) => Ok(Rval::Container(value.clone())),
        Rval::Empty => Ok(Rval::Empty),
    }
}

fn expand_fncall(
    ctx: &EvalContext,
    ns: &str,
    scope: &str,
    call: &FnCall,
    funcs: &FunctionTable,
    now: i64,
) -> Result<Rval, EvalError> {
    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(expand_rval(ctx, ns, scope, arg, funcs, now)?);
    }

    // Map-family calls legitimately carry `$(this)` placeholders in their
    // argument text; everything else defers to a later pass while an
    // argument is still unresolved.
    if !crate::functions::is_map_family(&call.name) && args.iter().any(has_unresolved_reference) {
        return Ok(Rval::FnCall(FnCall::new(call.name.clone(), args)));
    }

    let fn_ctx = FnCtx {
        ctx,
        ns,
        scope,
        now,
    };
    funcs.call(&call.name, &fn_ctx, &args)
}

/// The elements a naked list entry resolves to, or `None` when the entry
/// is not naked or does not name a list.
fn naked_list_elements(
    ctx: &EvalContext,
    ns: &str,
    scope: &str,
    item: &Rval,
) -> Option<Vec<Rval>> {
    let body = match item {
        // Only `@(...)` and `${...}` are naked forms; `$(...)` stringifies.
        Rval::Scalar(s) if s.starts_with('@') || s.starts_with("${") => {
            naked_reference_body(s)?
        }
        _ => return None,
    };
    let inner = expand_scalar(ctx, ns, scope, body);
    match lookup(ctx, ns, scope, &inner) {
        Some((Rval::List(items), _)) => Some(items),
        Some((Rval::Container(serde_json::Value::Array(items)), _)) => {
            Some(items.into_iter().map(Rval::Container).collect())
        }
        _ => None,
    }
}

fn has_unresolved_reference(rval: &Rval) -> bool {
    let mut found = false;
    rval.for_each_scalar(&mut |s| {
        if !found {
            let bytes = s.as_bytes();
            for i in 0..bytes.len().saturating_sub(1) {
                if bytes[i] == b'$' && matches!(bytes[i + 1], b'(' | b'{') {
                    found = true;
                    break;
                }
            }
        }
    });
    found
}
