//! Variable references
//!
//! A variable binds a fully-qualified reference `namespace:scope.name[i]...`
//! to a typed value. References in policy text may omit the namespace, the
//! scope, or both; resolution fills in the current bundle frame.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scopes that resolve directly instead of through the frame stack.
pub const SPECIAL_SCOPES: &[&str] = &["this", "sys", "const", "mon", "match"];

/// A parsed variable reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub namespace: Option<String>,
    pub scope: Option<String>,
    pub name: String,
    /// Index path for container / array access, in order.
    pub indices: Vec<String>,
}

impl VarRef {
    /// Parse a reference body as written between `$(` and `)`.
    ///
    /// Accepted shapes: `name`, `scope.name`, `ns:scope.name`, each with an
    /// optional `[index]...` suffix. Dots after the first are part of the
    /// name so container paths like `cfg.ports` inside a scope still work.
    pub fn parse(raw: &str) -> Self {
        let (ns, rest) = match raw.split_once(':') {
            Some((ns, rest)) if !ns.is_empty() => (Some(ns.to_string()), rest),
            _ => (None, raw),
        };

        // Split off [index] suffixes first.
        let (base, indices) = split_indices(rest);

        let (scope, name) = match base.split_once('.') {
            Some((scope, name)) if !scope.is_empty() && !name.is_empty() => {
                (Some(scope.to_string()), name.to_string())
            }
            _ => (None, base.to_string()),
        };

        Self {
            namespace: ns,
            scope,
            name,
            indices,
        }
    }

    /// A reference fully qualified against a namespace and scope, keeping an
    /// explicit qualification when the reference already carries one.
    pub fn qualify(&self, namespace: &str, scope: &str) -> Self {
        Self {
            namespace: Some(
                self.namespace
                    .clone()
                    .unwrap_or_else(|| namespace.to_string()),
            ),
            scope: Some(self.scope.clone().unwrap_or_else(|| scope.to_string())),
            name: self.name.clone(),
            indices: self.indices.clone(),
        }
    }

    /// True when the scope is one of the directly-resolved specials.
    pub fn is_special_scope(&self) -> bool {
        self.scope
            .as_deref()
            .map(|s| SPECIAL_SCOPES.contains(&s))
            .unwrap_or(false)
    }

    /// The table key for this reference within its scope's variable table.
    pub fn table_key(&self) -> String {
        if self.indices.is_empty() {
            self.name.clone()
        } else {
            let mut key = self.name.clone();
            for index in &self.indices {
                key.push('[');
                key.push_str(index);
                key.push(']');
            }
            key
        }
    }
}

fn split_indices(raw: &str) -> (&str, Vec<String>) {
    match raw.find('[') {
        None => (raw, Vec::new()),
        Some(open) => {
            let mut indices = Vec::new();
            let mut rest = &raw[open..];
            while let Some(stripped) = rest.strip_prefix('[') {
                match stripped.find(']') {
                    Some(close) => {
                        indices.push(stripped[..close].to_string());
                        rest = &stripped[close + 1..];
                    }
                    None => break, // unterminated index, keep what we have
                }
            }
            (&raw[..open], indices)
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}:", ns)?;
        }
        if let Some(scope) = &self.scope {
            write!(f, "{}.", scope)?;
        }
        write!(f, "{}", self.name)?;
        for index in &self.indices {
            write!(f, "[{}]", index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_bare_name() {
        let r = VarRef::parse("x");
        assert_eq!(r.namespace, None);
        assert_eq!(r.scope, None);
        assert_eq!(r.name, "x");
        assert!(r.indices.is_empty());
    }

    #[test]
    fn test_parse_qualified() {
        let r = VarRef::parse("prod:web.ports[0]");
        assert_eq!(r.namespace.as_deref(), Some("prod"));
        assert_eq!(r.scope.as_deref(), Some("web"));
        assert_eq!(r.name, "ports");
        assert_eq!(r.indices, vec!["0".to_string()]);
    }

    #[test]
    fn test_parse_special_scope() {
        let r = VarRef::parse("this.promiser");
        assert!(r.is_special_scope());
        assert_eq!(r.name, "promiser");
    }

    #[test]
    fn test_qualify_preserves_explicit() {
        let r = VarRef::parse("other.name").qualify("default", "main");
        assert_eq!(r.scope.as_deref(), Some("other"));
        assert_eq!(r.namespace.as_deref(), Some("default"));

        let bare = VarRef::parse("name").qualify("default", "main");
        assert_eq!(bare.scope.as_deref(), Some("main"));
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["x", "main.x", "ns:main.x[a][b]"] {
            assert_eq!(VarRef::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn test_table_key_includes_indices() {
        let r = VarRef::parse("cfg[ports][0]");
        assert_eq!(r.table_key(), "cfg[ports][0]");
    }

    proptest! {
        // Any reference built from identifier-shaped parts survives a
        // render/parse roundtrip unchanged.
        #[test]
        fn prop_display_parse_roundtrip(
            ns in proptest::option::of("[a-z][a-z0-9_]{0,8}"),
            scope in proptest::option::of("[a-z][a-z0-9_]{0,8}"),
            name in "[a-z][a-z0-9_]{0,8}",
            indices in proptest::collection::vec("[a-z0-9]{1,4}", 0..3),
        ) {
            let original = VarRef {
                namespace: ns,
                scope,
                name,
                indices,
            };
            let reparsed = VarRef::parse(&original.to_string());
            prop_assert_eq!(reparsed, original);
        }
    }
}
