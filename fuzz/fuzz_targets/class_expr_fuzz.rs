//! Fuzz target for the class-expression evaluator.
//!
//! Guards come from policy text and from the command line; evaluation must
//! reject malformed expressions with an error, never panic.
//!
//! Run with: cargo +nightly fuzz run class_expr_fuzz -- -max_total_time=60

#![no_main]

use accord_engine::classes::{eval_class_expr, ClassView};
use libfuzzer_sys::fuzz_target;

struct NothingDefined;

impl ClassView for NothingDefined {
    fn is_defined(&self, _name: &str) -> bool {
        false
    }

    fn for_each(&self, _f: &mut dyn FnMut(&str)) {}
}

fuzz_target!(|data: &[u8]| {
    if let Ok(expr) = std::str::from_utf8(data) {
        // With no classes defined, any well-formed positive expression is
        // false; errors are fine, panics are not.
        let _ = eval_class_expr(expr, &NothingDefined);
    }
});
