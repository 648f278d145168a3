//! The parsed policy tree
//!
//! A [`Policy`] is a rooted, immutable tree: an ordered sequence of bundles
//! and an ordered sequence of bodies. Bundles hold ordered sections keyed by
//! promise type; sections hold ordered promises. Nothing in this module is
//! mutated after parsing.

use crate::{PolicyError, Rval};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// The namespace bundles and bodies live in when none is declared.
pub const DEFAULT_NAMESPACE: &str = "default";

// ============================================================================
// SOURCE LOCATIONS
// ============================================================================

/// Where a policy object was declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ============================================================================
// PROMISE TYPES AND NORMAL ORDER
// ============================================================================

/// The promise types the dispatcher knows how to schedule.
///
/// Variant order is the normal evaluation order within a bundle; the
/// dispatcher visits sections sorted by this rank regardless of the order
/// they were written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PromiseType {
    Meta,
    Vars,
    Defaults,
    Classes,
    Users,
    Files,
    Packages,
    GuestEnvironments,
    Methods,
    Processes,
    Services,
    Commands,
    Storage,
    Databases,
    Access,
    Roles,
    Reports,
}

impl PromiseType {
    /// Parse the section keyword as written in policy text.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "meta" => Some(PromiseType::Meta),
            "vars" => Some(PromiseType::Vars),
            "defaults" => Some(PromiseType::Defaults),
            "classes" => Some(PromiseType::Classes),
            "users" => Some(PromiseType::Users),
            "files" => Some(PromiseType::Files),
            "packages" => Some(PromiseType::Packages),
            "guest_environments" => Some(PromiseType::GuestEnvironments),
            "methods" => Some(PromiseType::Methods),
            "processes" => Some(PromiseType::Processes),
            "services" => Some(PromiseType::Services),
            "commands" => Some(PromiseType::Commands),
            "storage" => Some(PromiseType::Storage),
            "databases" => Some(PromiseType::Databases),
            "access" => Some(PromiseType::Access),
            "roles" => Some(PromiseType::Roles),
            "reports" => Some(PromiseType::Reports),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> &'static str {
        match self {
            PromiseType::Meta => "meta",
            PromiseType::Vars => "vars",
            PromiseType::Defaults => "defaults",
            PromiseType::Classes => "classes",
            PromiseType::Users => "users",
            PromiseType::Files => "files",
            PromiseType::Packages => "packages",
            PromiseType::GuestEnvironments => "guest_environments",
            PromiseType::Methods => "methods",
            PromiseType::Processes => "processes",
            PromiseType::Services => "services",
            PromiseType::Commands => "commands",
            PromiseType::Storage => "storage",
            PromiseType::Databases => "databases",
            PromiseType::Access => "access",
            PromiseType::Roles => "roles",
            PromiseType::Reports => "reports",
        }
    }

    /// Promise types whose actuation can define variables or classes that
    /// later promises in the same pass read; these run at double rate.
    pub fn is_double_rate(&self) -> bool {
        matches!(self, PromiseType::Vars | PromiseType::Meta)
    }
}

impl fmt::Display for PromiseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_keyword())
    }
}

// ============================================================================
// PROMISES AND CONSTRAINTS
// ============================================================================

/// An `lval => rval` attribute of a promise or body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub lval: String,
    pub rval: Rval,
}

impl Constraint {
    pub fn new(lval: impl Into<String>, rval: Rval) -> Self {
        Self {
            lval: lval.into(),
            rval,
        }
    }
}

/// A declarative statement that the promiser should have a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promise {
    /// The object the promise is about; scalar rval, expanded before use.
    pub promiser: String,
    /// Who the promise is made to; scalar or list.
    pub promisee: Option<Rval>,
    /// Class guard expression; `any` when the promise carries no guard.
    pub guard: String,
    pub constraints: Vec<Constraint>,
    pub location: SourceLocation,
}

impl Promise {
    pub fn new(promiser: impl Into<String>) -> Self {
        Self {
            promiser: promiser.into(),
            promisee: None,
            guard: "any".to_string(),
            constraints: Vec::new(),
            location: SourceLocation::default(),
        }
    }

    /// Look up a constraint rvalue by attribute name.
    pub fn constraint(&self, lval: &str) -> Option<&Rval> {
        self.constraints
            .iter()
            .find(|c| c.lval == lval)
            .map(|c| &c.rval)
    }

    /// True when any constraint rvalue is a call to `name`, at any nesting
    /// depth of the argument tree.
    pub fn calls_function(&self, name: &str) -> bool {
        fn rval_calls(rval: &Rval, name: &str) -> bool {
            match rval {
                Rval::FnCall(call) => {
                    call.name == name || call.args.iter().any(|a| rval_calls(a, name))
                }
                Rval::List(items) => items.iter().any(|i| rval_calls(i, name)),
                _ => false,
            }
        }
        self.constraints.iter().any(|c| rval_calls(&c.rval, name))
    }

    /// Stable fingerprint used to name this promise's persistent lock.
    ///
    /// Computed over the declaration site and the unexpanded promiser, so the
    /// same promise hashes identically across runs and processes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.location.file.as_bytes());
        hasher.update(self.location.line.to_le_bytes());
        hasher.update(self.promiser.as_bytes());
        hex::encode(&hasher.finalize()[..12])
    }
}

// ============================================================================
// BUNDLES
// ============================================================================

/// Bundle type: which agent evaluates the bundle's promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleType {
    /// Evaluated by every component; classes and vars become global.
    Common,
    Agent,
    Server,
    Monitor,
}

impl BundleType {
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "common" => Some(BundleType::Common),
            "agent" => Some(BundleType::Agent),
            "server" => Some(BundleType::Server),
            "monitor" => Some(BundleType::Monitor),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> &'static str {
        match self {
            BundleType::Common => "common",
            BundleType::Agent => "agent",
            BundleType::Server => "server",
            BundleType::Monitor => "monitor",
        }
    }
}

impl fmt::Display for BundleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_keyword())
    }
}

/// One promise-type section inside a bundle, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub promise_type: PromiseType,
    pub promises: Vec<Promise>,
}

/// An ordered, named group of promise sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub namespace: String,
    pub name: String,
    pub bundle_type: BundleType,
    /// Formal parameter names, bound by `methods` promises.
    pub params: Vec<String>,
    pub sections: Vec<Section>,
    pub location: SourceLocation,
}

impl Bundle {
    pub fn new(name: impl Into<String>, bundle_type: BundleType) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.into(),
            bundle_type,
            params: Vec::new(),
            sections: Vec::new(),
            location: SourceLocation::default(),
        }
    }

    /// Sections sorted into normal evaluation order. Declared order is kept
    /// within a promise type.
    pub fn sections_in_normal_order(&self) -> Vec<&Section> {
        let mut sections: Vec<&Section> = self.sections.iter().collect();
        sections.sort_by_key(|s| s.promise_type);
        sections
    }
}

// ============================================================================
// BODIES
// ============================================================================

/// A named, typed attribute block inlined into promises by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub namespace: String,
    pub name: String,
    /// The attribute family this body fills in (`action`, `perms`, ...).
    pub body_type: String,
    pub params: Vec<String>,
    pub constraints: Vec<Constraint>,
    /// Parent body in the inheritance chain, walked oldest-first.
    pub inherit_from: Option<String>,
    pub location: SourceLocation,
}

impl Body {
    pub fn new(name: impl Into<String>, body_type: impl Into<String>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.into(),
            body_type: body_type.into(),
            params: Vec::new(),
            constraints: Vec::new(),
            inherit_from: None,
            location: SourceLocation::default(),
        }
    }
}

// ============================================================================
// POLICY ROOT
// ============================================================================

/// The root of a parsed policy: ordered bundles plus ordered bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Policy {
    pub bundles: Vec<Bundle>,
    pub bodies: Vec<Body>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a bundle by namespace and name.
    pub fn bundle(&self, namespace: &str, name: &str) -> Option<&Bundle> {
        self.bundles
            .iter()
            .find(|b| b.namespace == namespace && b.name == name)
    }

    /// Find a body by type and name.
    pub fn body(&self, body_type: &str, name: &str) -> Option<&Body> {
        self.bodies
            .iter()
            .find(|b| b.body_type == body_type && b.name == name)
    }

    /// The bundles named in `bundlesequence`, or every agent/common bundle
    /// without parameters when no sequence is given.
    pub fn bundle_sequence<'a>(&'a self, sequence: Option<&[String]>) -> Vec<&'a Bundle> {
        match sequence {
            Some(names) => names
                .iter()
                .filter_map(|name| self.bundle(DEFAULT_NAMESPACE, name))
                .collect(),
            None => self
                .bundles
                .iter()
                .filter(|b| {
                    b.params.is_empty()
                        && matches!(b.bundle_type, BundleType::Common | BundleType::Agent)
                })
                .collect(),
        }
    }

    /// Resolve a body's full constraint set by walking its `inherit_from`
    /// chain oldest-first; attributes set later in the walk override earlier
    /// ones.
    pub fn resolve_body_constraints(
        &self,
        body_type: &str,
        name: &str,
    ) -> Result<Vec<Constraint>, PolicyError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(n) = current {
            if !seen.insert(n.clone()) {
                let mut cycle: Vec<String> = seen.into_iter().collect();
                cycle.sort();
                return Err(PolicyError::InheritanceCycle {
                    body: name.to_string(),
                    chain: cycle,
                });
            }
            let body = self
                .body(body_type, &n)
                .ok_or_else(|| PolicyError::UnknownBody {
                    body_type: body_type.to_string(),
                    name: n.clone(),
                })?;
            current = body.inherit_from.clone();
            chain.push(body);
        }
        chain.reverse(); // oldest ancestor first

        let mut merged: Vec<Constraint> = Vec::new();
        for body in chain {
            for constraint in &body.constraints {
                if let Some(existing) = merged.iter_mut().find(|c| c.lval == constraint.lval) {
                    *existing = constraint.clone();
                } else {
                    merged.push(constraint.clone());
                }
            }
        }
        Ok(merged)
    }

    /// Structural validation run once after parsing: inheritance chains must
    /// be acyclic and bundle names unique per namespace.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut names = HashSet::new();
        for bundle in &self.bundles {
            if !names.insert((bundle.namespace.clone(), bundle.name.clone())) {
                return Err(PolicyError::DuplicateBundle {
                    namespace: bundle.namespace.clone(),
                    name: bundle.name.clone(),
                });
            }
        }
        for body in &self.bodies {
            self.resolve_body_constraints(&body.body_type, &body.name)?;
        }
        Ok(())
    }
}
