//! Token definitions

use serde::{Deserialize, Serialize};

/// A half-open byte range with the line/column of its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

/// Token kinds for the policy language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    // Structural keywords
    Bundle,
    Body,

    // Literals and names
    Identifier(String),
    String(String),
    Number(String),

    // Punctuation
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Colon,
    DoubleColon,
    FatArrow,
    ThinArrow,

    // Class-expression operators, kept as tokens so guards can be
    // reassembled from source text
    Not,
    Dot,
    Amp,
    Pipe,

    Eof,
    Error(String),
}

/// A token with its source span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}
