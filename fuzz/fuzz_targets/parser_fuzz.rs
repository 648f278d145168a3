//! Fuzz target for the policy parser.
//!
//! The parser must return a policy or a located diagnostic for any UTF-8
//! input, never panic or spin.
//!
//! Run with: cargo +nightly fuzz run parser_fuzz -- -max_total_time=60

#![no_main]

use accord_dsl::parse_policy;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        match parse_policy(input, "fuzz.acc") {
            Ok(policy) => {
                // A successful parse always survives structural validation
                // (parse_policy runs it), so the tree is internally sane.
                for bundle in &policy.bundles {
                    assert!(!bundle.name.is_empty());
                }
            }
            Err(e) => {
                // Diagnostics must render without panicking.
                let _ = e.to_string();
            }
        }
    }
});
