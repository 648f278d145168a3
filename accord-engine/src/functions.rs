//! Built-in function table
//!
//! The restricted function-call sublanguage of the policy language. Every
//! entry declares its arity; handlers receive the read-only context so they
//! can consult classes and variables, and return a fresh rvalue.
//!
//! The three map-family functions (`maplist`, `mapdata`, `maparray`) are
//! exempt from iterator-discovery pre-mangling and from the
//! unresolved-argument deferral, so their `$(this)` placeholders survive to
//! apply time.

use accord_core::{canonify, EvalError, Rval, VarRef};
use regex::Regex;
use std::collections::HashMap;

use crate::context::EvalContext;

/// Environment a function handler runs in.
pub struct FnCtx<'a> {
    pub ctx: &'a EvalContext,
    pub ns: &'a str,
    pub scope: &'a str,
    pub now: i64,
}

type Handler = Box<dyn Fn(&FnCtx, &[Rval]) -> Result<Rval, EvalError> + Send + Sync>;

/// Declared return shape of a function. The iteration engine only
/// pre-evaluates list-returning calls when hunting for wheels, so
/// scalar-returning functions with side effects run once per iteration, not
/// twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Scalar,
    List,
}

struct FnEntry {
    min_args: usize,
    max_args: usize,
    kind: FnKind,
    handler: Handler,
}

/// Registry of callable functions, seeded with the built-ins.
pub struct FunctionTable {
    entries: HashMap<String, FnEntry>,
}

/// True for the functions whose arguments keep their `$(this)` placeholders.
pub fn is_map_family(name: &str) -> bool {
    matches!(name, "maplist" | "mapdata" | "maparray")
}

impl FunctionTable {
    /// The standard built-in set.
    pub fn standard() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
        };
        table.register("canonify", 1, 1, FnKind::Scalar, Box::new(fn_canonify));
        table.register("concat", 0, usize::MAX, FnKind::Scalar, Box::new(fn_concat));
        table.register("join", 2, 2, FnKind::Scalar, Box::new(fn_join));
        table.register("splitstring", 3, 3, FnKind::List, Box::new(fn_splitstring));
        table.register("ifelse", 1, usize::MAX, FnKind::Scalar, Box::new(fn_ifelse));
        table.register("not", 1, 1, FnKind::Scalar, Box::new(fn_not));
        table.register("strcmp", 2, 2, FnKind::Scalar, Box::new(fn_strcmp));
        table.register("fileexists", 1, 1, FnKind::Scalar, Box::new(fn_fileexists));
        table.register("readfile", 1, 2, FnKind::Scalar, Box::new(fn_readfile));
        table.register("getindices", 1, 1, FnKind::List, Box::new(fn_getindices));
        table.register("maplist", 2, 2, FnKind::List, Box::new(fn_maplist));
        table.register("mapdata", 3, 3, FnKind::List, Box::new(fn_mapdata));
        table.register("maparray", 2, 2, FnKind::List, Box::new(fn_maparray));
        table
    }

    /// Add or replace an entry. Exposed so embedders and tests can register
    /// additional functions.
    pub fn register(
        &mut self,
        name: &str,
        min_args: usize,
        max_args: usize,
        kind: FnKind,
        handler: Handler,
    ) {
        self.entries.insert(
            name.to_string(),
            FnEntry {
                min_args,
                max_args,
                kind,
                handler,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// True when `name` is declared to return a list or container.
    pub fn returns_list(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| e.kind == FnKind::List)
            .unwrap_or(false)
    }

    /// Look up and apply a function.
    pub fn call(&self, name: &str, fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
        let entry = self.entries.get(name).ok_or_else(|| EvalError::Function {
            name: name.to_string(),
            reason: "unknown function".to_string(),
        })?;
        if args.len() < entry.min_args || args.len() > entry.max_args {
            return Err(EvalError::Function {
                name: name.to_string(),
                reason: format!("wrong argument count: {}", args.len()),
            });
        }
        (entry.handler)(fn_ctx, args)
    }
}

// ----------------------------------------------------------------------
// Argument helpers
// ----------------------------------------------------------------------

fn scalar_arg<'a>(name: &str, args: &'a [Rval], index: usize) -> Result<&'a str, EvalError> {
    match args.get(index) {
        Some(Rval::Scalar(s)) => Ok(s),
        other => Err(EvalError::Function {
            name: name.to_string(),
            reason: format!("argument {} must be a scalar, got {:?}", index + 1, other),
        }),
    }
}

fn list_arg<'a>(name: &str, args: &'a [Rval], index: usize) -> Result<&'a [Rval], EvalError> {
    match args.get(index) {
        Some(Rval::List(items)) => Ok(items),
        other => Err(EvalError::Function {
            name: name.to_string(),
            reason: format!("argument {} must be a list, got {:?}", index + 1, other),
        }),
    }
}

fn bool_rval(value: bool) -> Rval {
    Rval::scalar(if value { "true" } else { "false" })
}

// ----------------------------------------------------------------------
// Built-ins
// ----------------------------------------------------------------------

fn fn_canonify(_fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    Ok(Rval::Scalar(canonify(scalar_arg("canonify", args, 0)?)))
}

fn fn_concat(_fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let mut out = String::new();
    for (i, _) in args.iter().enumerate() {
        out.push_str(scalar_arg("concat", args, i)?);
    }
    Ok(Rval::Scalar(out))
}

fn fn_join(_fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let sep = scalar_arg("join", args, 0)?;
    let items = list_arg("join", args, 1)?;
    let parts: Vec<&str> = items
        .iter()
        .map(|item| item.as_scalar().unwrap_or_default())
        .collect();
    Ok(Rval::Scalar(parts.join(sep)))
}

fn fn_splitstring(_fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let input = scalar_arg("splitstring", args, 0)?;
    let sep = scalar_arg("splitstring", args, 1)?;
    let max: usize = scalar_arg("splitstring", args, 2)?
        .parse()
        .map_err(|_| EvalError::Function {
            name: "splitstring".to_string(),
            reason: "max must be an integer".to_string(),
        })?;
    let re = Regex::new(sep).map_err(|e| EvalError::Function {
        name: "splitstring".to_string(),
        reason: e.to_string(),
    })?;
    let parts: Vec<Rval> = re
        .splitn(input, max.max(1))
        .map(Rval::scalar)
        .collect();
    Ok(Rval::List(parts))
}

/// `ifelse(class1, value1, class2, value2, ..., fallback)`: the value of
/// the first defined class expression, else the fallback.
fn fn_ifelse(fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    if args.len() % 2 == 0 {
        return Err(EvalError::Function {
            name: "ifelse".to_string(),
            reason: "expects class/value pairs plus a fallback".to_string(),
        });
    }
    let mut i = 0;
    while i + 1 < args.len() {
        let expr = scalar_arg("ifelse", args, i)?;
        if fn_ctx.ctx.class_is_defined_at(expr, fn_ctx.now)? {
            return Ok(args[i + 1].clone());
        }
        i += 2;
    }
    Ok(args[args.len() - 1].clone())
}

fn fn_not(fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let expr = scalar_arg("not", args, 0)?;
    Ok(bool_rval(!fn_ctx.ctx.class_is_defined_at(expr, fn_ctx.now)?))
}

fn fn_strcmp(_fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    Ok(bool_rval(
        scalar_arg("strcmp", args, 0)? == scalar_arg("strcmp", args, 1)?,
    ))
}

fn fn_fileexists(_fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    Ok(bool_rval(std::path::Path::new(scalar_arg(
        "fileexists",
        args,
        0,
    )?)
    .exists()))
}

fn fn_readfile(_fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let path = scalar_arg("readfile", args, 0)?;
    let max: usize = match args.get(1) {
        Some(Rval::Scalar(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };
    let mut content = std::fs::read_to_string(path).map_err(|e| EvalError::Function {
        name: "readfile".to_string(),
        reason: format!("{}: {}", path, e),
    })?;
    if max > 0 && content.len() > max {
        content.truncate(max);
    }
    Ok(Rval::Scalar(content))
}

fn fn_getindices(fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let name = scalar_arg("getindices", args, 0)?;
    let r = VarRef::parse(name);
    let found = fn_ctx
        .ctx
        .variable_get(&r)
        .or_else(|| fn_ctx.ctx.variable_get(&r.qualify(fn_ctx.ns, fn_ctx.scope)));
    let indices = match found {
        Some((Rval::Container(serde_json::Value::Object(map)), _)) => {
            map.keys().map(|k| Rval::scalar(k.clone())).collect()
        }
        Some((Rval::Container(serde_json::Value::Array(items)), _)) => {
            (0..items.len()).map(|i| Rval::scalar(i.to_string())).collect()
        }
        Some((Rval::List(items), _)) => {
            (0..items.len()).map(|i| Rval::scalar(i.to_string())).collect()
        }
        _ => Vec::new(),
    };
    Ok(Rval::List(indices))
}

/// `maplist(expr, list)`: expand `$(this)` in `expr` once per element.
fn fn_maplist(fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let expr = scalar_arg("maplist", args, 0)?;
    let items = list_arg("maplist", args, 1)?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let elem = item.as_scalar().unwrap_or_default();
        let substituted = substitute_this(expr, &[("this", elem)]);
        out.push(Rval::Scalar(crate::expand::expand_scalar(
            fn_ctx.ctx,
            fn_ctx.ns,
            fn_ctx.scope,
            &substituted,
        )));
    }
    Ok(Rval::List(out))
}

/// `mapdata(mode, expr, container)`: expand `$(this.k)`/`$(this.v)` per
/// entry; `mode` is `none` or `canonify`.
fn fn_mapdata(fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let mode = scalar_arg("mapdata", args, 0)?;
    let expr = scalar_arg("mapdata", args, 1)?;
    let entries = container_entries("mapdata", args.get(2))?;

    let mut out = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let substituted = substitute_this(expr, &[("this.k", &k), ("this.v", &v)]);
        let expanded =
            crate::expand::expand_scalar(fn_ctx.ctx, fn_ctx.ns, fn_ctx.scope, &substituted);
        let value = match mode {
            "canonify" => canonify(&expanded),
            _ => expanded,
        };
        out.push(serde_json::Value::String(value));
    }
    Ok(Rval::Container(serde_json::Value::Array(out)))
}

/// `maparray(expr, container)`: like `mapdata` but yields an slist.
fn fn_maparray(fn_ctx: &FnCtx, args: &[Rval]) -> Result<Rval, EvalError> {
    let expr = scalar_arg("maparray", args, 0)?;
    let entries = container_entries("maparray", args.get(1))?;
    let mut out = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let substituted = substitute_this(expr, &[("this.k", &k), ("this.v", &v)]);
        out.push(Rval::Scalar(crate::expand::expand_scalar(
            fn_ctx.ctx,
            fn_ctx.ns,
            fn_ctx.scope,
            &substituted,
        )));
    }
    Ok(Rval::List(out))
}

fn container_entries(
    name: &str,
    arg: Option<&Rval>,
) -> Result<Vec<(String, String)>, EvalError> {
    match arg {
        Some(Rval::Container(serde_json::Value::Object(map))) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), json_leaf_text(v)))
            .collect()),
        Some(Rval::Container(serde_json::Value::Array(items))) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), json_leaf_text(v)))
            .collect()),
        Some(Rval::List(items)) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.as_scalar().unwrap_or_default().to_string()))
            .collect()),
        other => Err(EvalError::Function {
            name: name.to_string(),
            reason: format!("expected a container argument, got {:?}", other),
        }),
    }
}

fn json_leaf_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `$(key)` and `${key}` occurrences textually; used for the
/// map-family `this` bindings.
fn substitute_this(expr: &str, bindings: &[(&str, &str)]) -> String {
    let mut out = expr.to_string();
    for (key, value) in bindings {
        out = out.replace(&format!("$({})", key), value);
        out = out.replace(&format!("${{{}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FrameKind;
    use accord_core::VarType;

    fn fn_ctx_fixture() -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.push_frame(FrameKind::Bundle, "default", "main");
        ctx
    }

    fn call(ctx: &EvalContext, name: &str, args: &[Rval]) -> Result<Rval, EvalError> {
        let table = FunctionTable::standard();
        let fn_ctx = FnCtx {
            ctx,
            ns: "default",
            scope: "main",
            now: 0,
        };
        table.call(name, &fn_ctx, args)
    }

    #[test]
    fn test_canonify_and_concat() {
        let ctx = fn_ctx_fixture();
        assert_eq!(
            call(&ctx, "canonify", &[Rval::scalar("web-1.example")]).expect("call should succeed"),
            Rval::scalar("web_1_example")
        );
        assert_eq!(
            call(&ctx, "concat", &[Rval::scalar("a"), Rval::scalar("b")])
                .expect("call should succeed"),
            Rval::scalar("ab")
        );
    }

    #[test]
    fn test_join_and_splitstring() {
        let ctx = fn_ctx_fixture();
        assert_eq!(
            call(&ctx, "join", &[Rval::scalar(","), Rval::slist(["a", "b"])])
                .expect("call should succeed"),
            Rval::scalar("a,b")
        );
        assert_eq!(
            call(
                &ctx,
                "splitstring",
                &[Rval::scalar("a:b:c"), Rval::scalar(":"), Rval::scalar("10")]
            )
            .expect("call should succeed"),
            Rval::slist(["a", "b", "c"])
        );
    }

    #[test]
    fn test_ifelse_picks_first_defined() {
        let mut ctx = fn_ctx_fixture();
        ctx.class_put_hard("blue", None);
        let args = [
            Rval::scalar("red"),
            Rval::scalar("r"),
            Rval::scalar("blue"),
            Rval::scalar("b"),
            Rval::scalar("fallback"),
        ];
        assert_eq!(
            call(&ctx, "ifelse", &args).expect("call should succeed"),
            Rval::scalar("b")
        );
    }

    #[test]
    fn test_ifelse_fallback() {
        let ctx = fn_ctx_fixture();
        let args = [
            Rval::scalar("red"),
            Rval::scalar("r"),
            Rval::scalar("fallback"),
        ];
        assert_eq!(
            call(&ctx, "ifelse", &args).expect("call should succeed"),
            Rval::scalar("fallback")
        );
        assert!(call(&ctx, "ifelse", &args[..2]).is_err());
    }

    #[test]
    fn test_not_and_strcmp() {
        let ctx = fn_ctx_fixture();
        assert_eq!(
            call(&ctx, "not", &[Rval::scalar("any")]).expect("call should succeed"),
            Rval::scalar("false")
        );
        assert_eq!(
            call(&ctx, "strcmp", &[Rval::scalar("x"), Rval::scalar("x")])
                .expect("call should succeed"),
            Rval::scalar("true")
        );
    }

    #[test]
    fn test_maplist_binds_this() {
        let ctx = fn_ctx_fixture();
        let out = call(
            &ctx,
            "maplist",
            &[Rval::scalar("pre_$(this)"), Rval::slist(["a", "b"])],
        )
        .expect("call should succeed");
        assert_eq!(out, Rval::slist(["pre_a", "pre_b"]));
    }

    #[test]
    fn test_maparray_binds_key_and_value() {
        let ctx = fn_ctx_fixture();
        let container = Rval::Container(serde_json::json!({"p1": 80, "p2": 443}));
        let out = call(
            &ctx,
            "maparray",
            &[Rval::scalar("$(this.k)=$(this.v)"), container],
        )
        .expect("call should succeed");
        assert_eq!(out, Rval::slist(["p1=80", "p2=443"]));
    }

    #[test]
    fn test_mapdata_canonify_mode() {
        let ctx = fn_ctx_fixture();
        let container = Rval::Container(serde_json::json!(["x-1", "x-2"]));
        let out = call(
            &ctx,
            "mapdata",
            &[
                Rval::scalar("canonify"),
                Rval::scalar("$(this.v)"),
                container,
            ],
        )
        .expect("call should succeed");
        assert_eq!(
            out,
            Rval::Container(serde_json::json!(["x_1", "x_2"]))
        );
    }

    #[test]
    fn test_getindices() {
        let mut ctx = fn_ctx_fixture();
        ctx.variable_put(
            &VarRef::parse("cfg"),
            Rval::Container(serde_json::json!({"a": 1, "b": 2})),
            VarType::Container,
            vec![],
        )
        .expect("put should succeed");
        let out = call(&ctx, "getindices", &[Rval::scalar("cfg")]).expect("call should succeed");
        assert_eq!(out, Rval::slist(["a", "b"]));
    }

    #[test]
    fn test_readfile_and_fileexists() {
        let ctx = fn_ctx_fixture();
        let tmp = tempfile::NamedTempFile::new().expect("tempfile should succeed");
        std::fs::write(tmp.path(), "line one\nline two\n").expect("write should succeed");
        let path = tmp.path().display().to_string();

        assert_eq!(
            call(&ctx, "fileexists", &[Rval::scalar(&path)]).expect("call should succeed"),
            Rval::scalar("true")
        );
        assert_eq!(
            call(
                &ctx,
                "readfile",
                &[Rval::scalar(&path), Rval::scalar("8")]
            )
            .expect("call should succeed"),
            Rval::scalar("line one")
        );
    }

    #[test]
    fn test_custom_registration() {
        let mut table = FunctionTable::standard();
        table.register(
            "shout",
            1,
            1,
            FnKind::Scalar,
            Box::new(|_fn_ctx, args| {
                Ok(Rval::Scalar(
                    args[0].as_scalar().unwrap_or_default().to_uppercase(),
                ))
            }),
        );
        let ctx = fn_ctx_fixture();
        let fn_ctx = FnCtx {
            ctx: &ctx,
            ns: "default",
            scope: "main",
            now: 0,
        };
        assert_eq!(
            table
                .call("shout", &fn_ctx, &[Rval::scalar("hey")])
                .expect("call should succeed"),
            Rval::scalar("HEY")
        );
    }
}
