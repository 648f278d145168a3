//! Evaluation context
//!
//! A stack of frames over an arena, holding everything mutable during a run:
//! variable tables, soft class sets, iteration bindings, and the
//! process-wide hard class set. Bundle-scoped variables live in run-wide
//! tables keyed by `namespace:bundle` so they stay resolvable after the
//! bundle frame pops; frame-local variables (parameters, body arguments) die
//! with their frame.

use accord_core::{canonify, EvalError, PersistentClass, PersistentClassPolicy, Rval, VarRef, VarType};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::classes;

/// The five frame kinds, pushed and popped LIFO around evaluation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Bundle,
    BundleSection,
    Body,
    Promise,
    PromiseIteration,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Bundle => "bundle",
            FrameKind::BundleSection => "bundle-section",
            FrameKind::Body => "body",
            FrameKind::Promise => "promise",
            FrameKind::PromiseIteration => "promise-iteration",
        };
        write!(f, "{}", name)
    }
}

/// A variable with its declared type and provenance tags.
#[derive(Debug, Clone, PartialEq)]
pub struct VarBinding {
    pub value: Rval,
    pub var_type: VarType,
    pub tags: Vec<String>,
}

impl VarBinding {
    pub fn new(value: Rval, var_type: VarType) -> Self {
        Self {
            value,
            var_type,
            tags: Vec::new(),
        }
    }
}

struct Frame {
    kind: FrameKind,
    namespace: String,
    scope: String,
    vars: HashMap<String, VarBinding>,
    soft_classes: HashSet<String>,
}

/// The mutable evaluation state of one agent run.
pub struct EvalContext {
    frames: Vec<Frame>,
    stack: Vec<usize>,
    /// Bundle-scoped variables, keyed `namespace:bundle`, surviving frame pops.
    bundle_tables: HashMap<String, HashMap<String, VarBinding>>,
    /// Hard classes with optional expiry (persistent classes carry one).
    hard_classes: HashMap<String, Option<i64>>,
    /// Classes forced undefined from the command line.
    negated: HashSet<String>,
    sys_vars: HashMap<String, VarBinding>,
    const_vars: HashMap<String, VarBinding>,
    /// The `this` scope, repopulated on every promise iteration.
    this_vars: HashMap<String, VarBinding>,
    /// Current iteration element per discovered reference text.
    iteration_bindings: HashMap<String, Rval>,
    /// Persistent class updates to flush to the classes database.
    pending_persistent: Vec<(PersistentClass, PersistentClassPolicy)>,
}

impl EvalContext {
    pub fn new() -> Self {
        let mut ctx = Self {
            frames: Vec::new(),
            stack: Vec::new(),
            bundle_tables: HashMap::new(),
            hard_classes: HashMap::new(),
            negated: HashSet::new(),
            sys_vars: HashMap::new(),
            const_vars: HashMap::new(),
            this_vars: HashMap::new(),
            iteration_bindings: HashMap::new(),
            pending_persistent: Vec::new(),
        };
        ctx.hard_classes.insert("any".to_string(), None);
        ctx.const_vars
            .insert("n".to_string(), VarBinding::new(Rval::scalar("\n"), VarType::String));
        ctx.const_vars
            .insert("t".to_string(), VarBinding::new(Rval::scalar("\t"), VarType::String));
        ctx.const_vars.insert(
            "dollar".to_string(),
            VarBinding::new(Rval::scalar("$"), VarType::String),
        );
        ctx.const_vars.insert(
            "endl".to_string(),
            VarBinding::new(Rval::scalar("\n"), VarType::String),
        );
        ctx
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Push a frame; `namespace`/`scope` name the bundle or body it belongs
    /// to. Returns the frame's arena id.
    pub fn push_frame(&mut self, kind: FrameKind, namespace: &str, scope: &str) -> usize {
        let id = self.frames.len();
        self.frames.push(Frame {
            kind,
            namespace: namespace.to_string(),
            scope: scope.to_string(),
            vars: HashMap::new(),
            soft_classes: HashSet::new(),
        });
        self.stack.push(id);
        if kind == FrameKind::Bundle {
            self.bundle_tables
                .entry(qualified_scope(namespace, scope))
                .or_default();
        }
        id
    }

    /// Pop the innermost frame, asserting its kind matches what was pushed.
    pub fn pop_frame(&mut self, kind: FrameKind) -> Result<(), EvalError> {
        let id = self.stack.pop().ok_or(EvalError::FrameUnderflow)?;
        let frame = &self.frames[id];
        if frame.kind != kind {
            return Err(EvalError::FrameKindMismatch {
                expected: kind.to_string(),
                got: frame.kind.to_string(),
            });
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Namespace of the innermost bundle frame.
    pub fn current_namespace(&self) -> String {
        self.innermost_bundle()
            .map(|f| f.namespace.clone())
            .unwrap_or_else(|| accord_core::DEFAULT_NAMESPACE.to_string())
    }

    /// Name of the innermost bundle frame.
    pub fn current_bundle(&self) -> String {
        self.innermost_bundle()
            .map(|f| f.scope.clone())
            .unwrap_or_default()
    }

    fn innermost_bundle(&self) -> Option<&Frame> {
        self.stack
            .iter()
            .rev()
            .map(|&id| &self.frames[id])
            .find(|f| f.kind == FrameKind::Bundle)
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Bind a variable. Unqualified references land in the current bundle's
    /// table; `this.x` lands in the iteration scope. Fails with
    /// `ScopeAbsent` when the requested scope has no live frame.
    pub fn variable_put(
        &mut self,
        r: &VarRef,
        value: Rval,
        var_type: VarType,
        tags: Vec<String>,
    ) -> Result<(), EvalError> {
        if r.scope.as_deref() == Some("this") {
            self.this_vars.insert(
                r.table_key(),
                VarBinding {
                    value,
                    var_type,
                    tags,
                },
            );
            return Ok(());
        }

        let scope = match &r.scope {
            Some(s) => s.clone(),
            None => {
                let current = self.current_bundle();
                if current.is_empty() {
                    return Err(EvalError::ScopeAbsent {
                        scope: "<bundle>".to_string(),
                    });
                }
                current
            }
        };

        // The scope must be on the stack somewhere; writing into a bundle
        // that is not being evaluated is a policy error.
        let namespace = match self
            .stack
            .iter()
            .rev()
            .map(|&id| &self.frames[id])
            .find(|f| f.scope == scope)
        {
            Some(frame) => r
                .namespace
                .clone()
                .unwrap_or_else(|| frame.namespace.clone()),
            None => return Err(EvalError::ScopeAbsent { scope }),
        };

        self.bundle_tables
            .entry(qualified_scope(&namespace, &scope))
            .or_default()
            .insert(
                r.table_key(),
                VarBinding {
                    value,
                    var_type,
                    tags,
                },
            );
        Ok(())
    }

    /// Bind a frame-local variable (bundle parameters, body arguments); it
    /// dies when the innermost frame pops.
    pub fn variable_put_local(&mut self, name: &str, binding: VarBinding) -> Result<(), EvalError> {
        let id = *self.stack.last().ok_or(EvalError::FrameUnderflow)?;
        self.frames[id].vars.insert(name.to_string(), binding);
        Ok(())
    }

    /// Resolve a reference, searching inner to outer. Special scopes
    /// resolve directly.
    pub fn variable_get(&self, r: &VarRef) -> Option<(Rval, VarType)> {
        if r.is_special_scope() {
            let table = match r.scope.as_deref() {
                Some("this") => &self.this_vars,
                Some("sys") => &self.sys_vars,
                Some("const") => &self.const_vars,
                // `mon` and `match` exist but are fed by external
                // collaborators; they resolve to nothing here.
                _ => return None,
            };
            return lookup_with_indices(table, r);
        }

        // Frame-local variables shadow bundle tables.
        for &id in self.stack.iter().rev() {
            let frame = &self.frames[id];
            if let Some(scope) = &r.scope {
                if &frame.scope != scope {
                    continue;
                }
            }
            if let Some(found) = lookup_with_indices(&frame.vars, r) {
                return Some(found);
            }
        }

        let namespace = r
            .namespace
            .clone()
            .unwrap_or_else(|| self.current_namespace());
        let scope = r.scope.clone().unwrap_or_else(|| self.current_bundle());
        let table = self.bundle_tables.get(&qualified_scope(&namespace, &scope))?;
        lookup_with_indices(table, r)
    }

    // ------------------------------------------------------------------
    // Iteration bindings and `this`
    // ------------------------------------------------------------------

    pub fn set_iteration_binding(&mut self, ref_text: &str, value: Rval) {
        self.iteration_bindings.insert(ref_text.to_string(), value);
    }

    pub fn iteration_binding(&self, ref_text: &str) -> Option<&Rval> {
        self.iteration_bindings.get(ref_text)
    }

    pub fn clear_iteration_bindings(&mut self) {
        self.iteration_bindings.clear();
    }

    pub fn set_this(&mut self, key: &str, value: Rval) {
        self.this_vars
            .insert(key.to_string(), VarBinding::new(value, VarType::String));
    }

    pub fn clear_this(&mut self) {
        self.this_vars.clear();
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    /// Define a hard class, optionally with an expiry time.
    pub fn class_put_hard(&mut self, name: &str, expires_at: Option<i64>) {
        self.hard_classes.insert(canonify(name), expires_at);
    }

    /// Define a soft class in the innermost bundle frame; it dies with the
    /// frame.
    pub fn class_put_soft(&mut self, name: &str) -> Result<(), EvalError> {
        let id = self
            .stack
            .iter()
            .rev()
            .copied()
            .find(|&id| self.frames[id].kind == FrameKind::Bundle)
            .ok_or(EvalError::ScopeAbsent {
                scope: "<bundle>".to_string(),
            })?;
        self.frames[id].soft_classes.insert(canonify(name));
        Ok(())
    }

    /// Define a persistent class: visible now as a hard class with expiry,
    /// and queued for the classes database.
    pub fn class_put_persistent(
        &mut self,
        name: &str,
        ttl_minutes: i64,
        policy: PersistentClassPolicy,
        now: i64,
    ) {
        let name = canonify(name);
        let expires_at = now + ttl_minutes * 60;
        let record = PersistentClass {
            name: name.clone(),
            expires_at,
            tags: Vec::new(),
        };
        if policy == PersistentClassPolicy::Preserve {
            if let Some(Some(existing)) = self.hard_classes.get(&name) {
                // Keep the original countdown.
                self.pending_persistent.push((
                    PersistentClass {
                        expires_at: *existing,
                        ..record
                    },
                    policy,
                ));
                return;
            }
        }
        self.hard_classes.insert(name, Some(expires_at));
        self.pending_persistent.push((record, policy));
    }

    /// Drain the persistent class updates queued during evaluation.
    pub fn take_pending_persistent(&mut self) -> Vec<(PersistentClass, PersistentClassPolicy)> {
        std::mem::take(&mut self.pending_persistent)
    }

    /// Force a class undefined for the whole run (`--negate`).
    pub fn negate_class(&mut self, name: &str) {
        self.negated.insert(canonify(name));
    }

    /// Evaluate a class expression against the current class sets. Expired
    /// hard classes are dropped before evaluation.
    pub fn class_is_defined(&mut self, expr: &str, now: i64) -> Result<bool, EvalError> {
        self.purge_expired(now);
        self.class_is_defined_at(expr, now)
    }

    /// Read-only variant: expired classes count as undefined but are not
    /// removed. Used by built-in functions, which see the context immutably.
    pub fn class_is_defined_at(&self, expr: &str, now: i64) -> Result<bool, EvalError> {
        classes::eval_class_expr(expr, &ContextClasses { ctx: self, now })
    }

    /// Membership test for a single canonical class name at time `now`.
    pub fn has_class_at(&self, name: &str, now: i64) -> bool {
        if self.negated.contains(name) {
            return false;
        }
        if let Some(expiry) = self.hard_classes.get(name) {
            return expiry.map(|at| now < at).unwrap_or(true);
        }
        self.stack
            .iter()
            .rev()
            .any(|&id| self.frames[id].soft_classes.contains(name))
    }

    /// Membership test ignoring expiry; prefer [`has_class_at`](Self::has_class_at).
    pub fn has_class(&self, name: &str) -> bool {
        self.has_class_at(name, i64::MIN)
    }

    /// Number of currently defined classes; the convergence loop watches
    /// this to detect a fixed point.
    pub fn class_count(&self) -> usize {
        let soft: usize = self
            .stack
            .iter()
            .map(|&id| self.frames[id].soft_classes.len())
            .sum();
        self.hard_classes.len() + soft
    }

    fn purge_expired(&mut self, now: i64) {
        self.hard_classes
            .retain(|_, expiry| expiry.map(|at| now < at).unwrap_or(true));
    }

    fn for_each_class(&self, f: &mut dyn FnMut(&str)) {
        for name in self.hard_classes.keys() {
            if !self.negated.contains(name) {
                f(name);
            }
        }
        for &id in &self.stack {
            for name in &self.frames[id].soft_classes {
                if !self.negated.contains(name) {
                    f(name);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // System variables
    // ------------------------------------------------------------------

    pub fn sys_var_put(&mut self, name: &str, value: Rval) {
        self.sys_vars
            .insert(name.to_string(), VarBinding::new(value, VarType::String));
    }
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Class view over a context, handed to the class-expression evaluator.
struct ContextClasses<'a> {
    ctx: &'a EvalContext,
    now: i64,
}

impl classes::ClassView for ContextClasses<'_> {
    fn is_defined(&self, name: &str) -> bool {
        self.ctx.has_class_at(name, self.now)
    }

    fn for_each(&self, f: &mut dyn FnMut(&str)) {
        self.ctx.for_each_class(f);
    }
}

fn qualified_scope(namespace: &str, scope: &str) -> String {
    format!("{}:{}", namespace, scope)
}

fn lookup_with_indices(
    table: &HashMap<String, VarBinding>,
    r: &VarRef,
) -> Option<(Rval, VarType)> {
    // Exact key first: `x[i]` may be bound directly.
    if let Some(binding) = table.get(&r.table_key()) {
        return Some((binding.value.clone(), binding.var_type));
    }
    if r.indices.is_empty() {
        return None;
    }
    // Otherwise navigate a container by the index path.
    let base = table.get(&r.name)?;
    match &base.value {
        Rval::Container(value) => {
            let mut node = value;
            for index in &r.indices {
                node = match node {
                    serde_json::Value::Object(map) => map.get(index)?,
                    serde_json::Value::Array(items) => items.get(index.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            Some((Rval::Container(node.clone()), VarType::Container))
        }
        Rval::List(items) => {
            let index = r.indices.first()?.parse::<usize>().ok()?;
            items
                .get(index)
                .map(|item| (item.clone(), VarType::String))
        }
        _ => None,
    }
}
