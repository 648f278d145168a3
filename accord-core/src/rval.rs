//! Rvalue types
//!
//! Every right-hand side in the policy language is an [`Rval`]: a scalar that
//! may still contain `$(x)` / `@(x)` references, an ordered list, an
//! unevaluated function call, a JSON container, or nothing at all. Rvalues
//! stay textual until the expansion engine rewrites them against a concrete
//! evaluation context.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// RVALUE SUM TYPE
// ============================================================================

/// A policy right-hand value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rval {
    /// A string, possibly containing unresolved `$(x)`/`${x}`/`@(x)` references.
    Scalar(String),
    /// An ordered sequence of rvalues.
    List(Vec<Rval>),
    /// An unevaluated call into the built-in function table.
    FnCall(FnCall),
    /// A nested map/array of JSON primitives, produced by JSON inputs.
    Container(serde_json::Value),
    /// No value (an attribute mentioned without a right-hand side).
    Empty,
}

/// A function call rvalue: name plus argument list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnCall {
    pub name: String,
    pub args: Vec<Rval>,
}

impl FnCall {
    pub fn new(name: impl Into<String>, args: Vec<Rval>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl Rval {
    /// Scalar constructor, for readability at call sites.
    pub fn scalar(s: impl Into<String>) -> Self {
        Rval::Scalar(s.into())
    }

    /// A list of scalars.
    pub fn slist<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Rval::List(items.into_iter().map(Rval::scalar).collect())
    }

    /// The scalar contents, if this is a scalar.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Rval::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// The list contents, if this is a list.
    pub fn as_list(&self) -> Option<&[Rval]> {
        match self {
            Rval::List(items) => Some(items),
            _ => None,
        }
    }

    /// True when the rvalue is a single naked reference, `@(lst)` or
    /// `${lst}`, with no surrounding text. Naked references are inlined
    /// into their parent list instead of being stringified; a plain
    /// `$(lst)` is not naked.
    pub fn is_naked_reference(&self) -> bool {
        match self {
            Rval::Scalar(s) if s.starts_with('@') || s.starts_with("${") => {
                naked_reference_body(s).is_some()
            }
            _ => false,
        }
    }

    /// Walk every scalar in this rvalue, depth-first, left to right.
    pub fn for_each_scalar<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Rval::Scalar(s) => f(s),
            Rval::List(items) => {
                for item in items {
                    item.for_each_scalar(f);
                }
            }
            Rval::FnCall(call) => {
                for arg in &call.args {
                    arg.for_each_scalar(f);
                }
            }
            Rval::Container(_) | Rval::Empty => {}
        }
    }
}

/// If `s` is exactly one `@(name)`, `@{name}`, `$(name)` or `${name}`,
/// return the reference body.
pub fn naked_reference_body(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() < 4 {
        return None;
    }
    let sigil = bytes[0];
    if sigil != b'@' && sigil != b'$' {
        return None;
    }
    let (open, close) = match bytes[1] {
        b'(' => (b'(', b')'),
        b'{' => (b'{', b'}'),
        _ => return None,
    };
    if bytes[bytes.len() - 1] != close {
        return None;
    }
    // The closing delimiter must match the opener at depth zero, exactly at
    // the end of the string.
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return if i == bytes.len() - 1 {
                    Some(&s[2..bytes.len() - 1])
                } else {
                    None
                };
            }
        }
    }
    None
}

impl fmt::Display for Rval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rval::Scalar(s) => write!(f, "{}", s),
            Rval::List(items) => {
                write!(f, "{{ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, " }}")
            }
            Rval::FnCall(call) => {
                write!(f, "{}(", call.name)?;
                for (i, arg) in call.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Rval::Container(value) => write!(f, "{}", value),
            Rval::Empty => Ok(()),
        }
    }
}

// ============================================================================
// VARIABLE TYPES
// ============================================================================

/// Declared type of a variable binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    String,
    Int,
    Real,
    Bool,
    Slist,
    Rlist,
    Container,
}

impl VarType {
    /// Parse the constraint keyword used in `vars` promises.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "string" => Some(VarType::String),
            "int" => Some(VarType::Int),
            "real" => Some(VarType::Real),
            "boolean" => Some(VarType::Bool),
            "slist" => Some(VarType::Slist),
            "rlist" => Some(VarType::Rlist),
            "data" => Some(VarType::Container),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> &'static str {
        match self {
            VarType::String => "string",
            VarType::Int => "int",
            VarType::Real => "real",
            VarType::Bool => "boolean",
            VarType::Slist => "slist",
            VarType::Rlist => "rlist",
            VarType::Container => "data",
        }
    }

    /// True for the list-shaped types that drive iteration wheels.
    pub fn is_list(&self) -> bool {
        matches!(self, VarType::Slist | VarType::Rlist)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naked_reference_detection() {
        assert_eq!(naked_reference_body("@(lst)"), Some("lst"));
        assert_eq!(naked_reference_body("${x}"), Some("x"));
        assert_eq!(naked_reference_body("@(a.b)"), Some("a.b"));
        assert_eq!(naked_reference_body("@($(name))"), Some("$(name)"));
        assert_eq!(naked_reference_body("pre @(lst)"), None);
        assert_eq!(naked_reference_body("@(lst) post"), None);
        assert_eq!(naked_reference_body("$(a)$(b)"), None);
        assert_eq!(naked_reference_body("plain"), None);
        assert_eq!(naked_reference_body(""), None);
    }

    #[test]
    fn test_var_type_keyword_roundtrip() {
        for vt in [
            VarType::String,
            VarType::Int,
            VarType::Real,
            VarType::Bool,
            VarType::Slist,
            VarType::Rlist,
            VarType::Container,
        ] {
            let parsed =
                VarType::from_keyword(vt.as_keyword()).expect("keyword roundtrip should succeed");
            assert_eq!(vt, parsed);
        }
        assert_eq!(VarType::from_keyword("widget"), None);
    }

    #[test]
    fn test_rval_display() {
        let rval = Rval::List(vec![
            Rval::scalar("a"),
            Rval::FnCall(FnCall::new("canonify", vec![Rval::scalar("b-c")])),
        ]);
        assert_eq!(rval.to_string(), "{ a, canonify(b-c) }");
    }
}
