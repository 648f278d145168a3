//! Promise outcomes and aggregation
//!
//! Every actuation produces an [`Outcome`]. Outcomes aggregate by severity:
//! the worst result wins when a promise fires several times or a bundle
//! rolls its promises up.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of actuating one promise (or an aggregate of several).
///
/// Variant order is severity order; `Ord` gives the aggregation rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Outcome {
    /// Promise was already kept; nothing to do.
    #[default]
    Kept,
    /// Promise was not considered: guard false, lock contention, or empty
    /// iterator.
    Skipped,
    /// Promise was not kept and the actuator converged it.
    Repaired,
    /// Promise is not kept and only a warning was issued (dry-run, or
    /// warn-only action policy).
    Warn,
    /// Actuation was attempted and failed.
    Fail,
    /// Actuation was refused (permissions, admit rules).
    Denied,
}

impl Outcome {
    /// Aggregate two outcomes; the more severe wins.
    pub fn worst(self, other: Outcome) -> Outcome {
        self.max(other)
    }

    /// True for outcomes that report host state drift was (or would be)
    /// corrected.
    pub fn is_change(&self) -> bool {
        matches!(self, Outcome::Repaired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Kept => "kept",
            Outcome::Skipped => "skipped",
            Outcome::Repaired => "repaired",
            Outcome::Warn => "warn",
            Outcome::Fail => "fail",
            Outcome::Denied => "denied",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Running totals for one agent pass, keyed by outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutcomeTally {
    pub kept: usize,
    pub skipped: usize,
    pub repaired: usize,
    pub warned: usize,
    pub failed: usize,
    pub denied: usize,
}

impl OutcomeTally {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Kept => self.kept += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Repaired => self.repaired += 1,
            Outcome::Warn => self.warned += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Denied => self.denied += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.kept + self.skipped + self.repaired + self.warned + self.failed + self.denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_worst_wins() {
        assert_eq!(Outcome::Kept.worst(Outcome::Repaired), Outcome::Repaired);
        assert_eq!(Outcome::Repaired.worst(Outcome::Skipped), Outcome::Repaired);
        assert_eq!(Outcome::Warn.worst(Outcome::Fail), Outcome::Fail);
        assert_eq!(Outcome::Fail.worst(Outcome::Denied), Outcome::Denied);
        assert_eq!(Outcome::Kept.worst(Outcome::Kept), Outcome::Kept);
    }

    #[test]
    fn test_severity_order_is_total() {
        let order = [
            Outcome::Kept,
            Outcome::Skipped,
            Outcome::Repaired,
            Outcome::Warn,
            Outcome::Fail,
            Outcome::Denied,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_tally() {
        let mut tally = OutcomeTally::default();
        tally.record(Outcome::Kept);
        tally.record(Outcome::Repaired);
        tally.record(Outcome::Repaired);
        assert_eq!(tally.kept, 1);
        assert_eq!(tally.repaired, 2);
        assert_eq!(tally.total(), 3);
    }
}
