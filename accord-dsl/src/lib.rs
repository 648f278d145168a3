//! Accord DSL - policy language front end
//!
//! Turns UTF-8 policy text into the immutable [`accord_core::Policy`] tree
//! consumed by the evaluation engine. The grammar is line-oriented and
//! declarative: `bundle` and `body` blocks, promise sections, class guards,
//! and `lval => rval` constraints.

pub mod lexer;
pub mod parser;

pub use lexer::{Lexer, Span, Token, TokenKind};
pub use parser::{parse_policy, parse_policy_file, parse_policy_resilient, Parser};
