//! Fuzz target for the policy lexer.
//!
//! Feeds arbitrary UTF-8 at the lexer looking for panics, infinite loops
//! and span bookkeeping errors.
//!
//! Run with: cargo +nightly fuzz run lexer_fuzz -- -max_total_time=60

#![no_main]

use accord_dsl::{Lexer, TokenKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let tokens = Lexer::new(input).tokenize();

        // The stream always ends in exactly one Eof.
        assert!(!tokens.is_empty(), "tokenization should produce at least Eof");
        assert_eq!(
            tokens.last().map(|t| &t.kind),
            Some(&TokenKind::Eof),
            "last token should always be Eof"
        );

        // Spans stay inside the source and never run backwards.
        for token in &tokens {
            assert!(token.span.start <= token.span.end);
            assert!(token.span.end <= input.len());
            assert!(token.span.line >= 1);
            assert!(token.span.column >= 1);
        }
    }
});
