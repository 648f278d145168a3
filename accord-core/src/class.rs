//! Class naming and persistence policy
//!
//! Classes are boolean predicates keyed by a canonical string. Canonical
//! names contain only alphanumerics and `_`; every other byte is rewritten
//! to `_`.

use serde::{Deserialize, Serialize};

/// Canonicalise a string into a legal class name.
pub fn canonify(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// What happens to a persistent class's timer when it is set again while
/// still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistentClassPolicy {
    /// Keep the original expiry.
    Preserve,
    /// Restart the countdown from now.
    Reset,
}

/// A persistent class record as stored in the classes database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentClass {
    pub name: String,
    /// Unix time after which the class is no longer defined.
    pub expires_at: i64,
    pub tags: Vec<String>,
}

impl PersistentClass {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonify() {
        assert_eq!(canonify("web-server.example"), "web_server_example");
        assert_eq!(canonify("already_ok_123"), "already_ok_123");
        assert_eq!(canonify("spaces here"), "spaces_here");
        assert_eq!(canonify(""), "");
    }

    proptest! {
        #[test]
        fn prop_canonify_output_is_canonical(s in ".*") {
            let canonical = canonify(&s);
            prop_assert!(canonical
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }

        #[test]
        fn prop_canonify_idempotent(s in ".*") {
            let once = canonify(&s);
            prop_assert_eq!(canonify(&once), once.clone());
        }
    }

    #[test]
    fn test_persistent_class_expiry() {
        let class = PersistentClass {
            name: "maintenance".to_string(),
            expires_at: 1_000,
            tags: vec![],
        };
        assert!(!class.is_expired(999));
        assert!(class.is_expired(1_000));
    }
}
