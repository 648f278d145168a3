//! Class algebra
//!
//! Class expressions are infix boolean terms over the context's class sets:
//! `!` negation, `.`/`&` conjunction, `|`/`||` disjunction, parentheses,
//! plus the regex forms `class_matching(/re/)` and
//! `class_count(/re/, min..max)`. Evaluation is pure and short-circuit;
//! invalid syntax surfaces as an error that fails the owning promise.

use accord_core::EvalError;
use regex::Regex;

/// Read access to the defined class set during expression evaluation.
pub trait ClassView {
    fn is_defined(&self, name: &str) -> bool;
    fn for_each(&self, f: &mut dyn FnMut(&str));
}

/// Evaluate `expr` against `view`.
pub fn eval_class_expr(expr: &str, view: &dyn ClassView) -> Result<bool, EvalError> {
    let tokens = tokenize(expr)?;
    let mut parser = ExprParser {
        expr,
        tokens,
        pos: 0,
    };
    let ast = parser.parse_or()?;
    parser.expect_end()?;
    Ok(eval(&ast, view))
}

// ----------------------------------------------------------------------
// AST and evaluation
// ----------------------------------------------------------------------

enum Node {
    Class(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Matching(Regex),
    Count(Regex, usize, usize),
}

fn eval(node: &Node, view: &dyn ClassView) -> bool {
    match node {
        Node::Class(name) => view.is_defined(name),
        Node::Not(inner) => !eval(inner, view),
        Node::And(lhs, rhs) => eval(lhs, view) && eval(rhs, view),
        Node::Or(lhs, rhs) => eval(lhs, view) || eval(rhs, view),
        Node::Matching(re) => count_matching(re, view) > 0,
        Node::Count(re, min, max) => {
            let count = count_matching(re, view);
            count >= *min && count <= *max
        }
    }
}

fn count_matching(re: &Regex, view: &dyn ClassView) -> usize {
    let mut count = 0usize;
    view.for_each(&mut |name| {
        if re.is_match(name) {
            count += 1;
        }
    });
    count
}

// ----------------------------------------------------------------------
// Tokens
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Not,
    And,
    Or,
    LParen,
    RParen,
    Comma,
    Regex(String),
    Range(usize, usize),
}

fn tokenize(expr: &str) -> Result<Vec<Tok>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '!' => {
                chars.next();
                tokens.push(Tok::Not);
            }
            '.' | '&' => {
                chars.next();
                if c == '&' && chars.peek().map(|&(_, c)| c) == Some('&') {
                    chars.next();
                }
                tokens.push(Tok::And);
            }
            '|' => {
                chars.next();
                if chars.peek().map(|&(_, c)| c) == Some('|') {
                    chars.next();
                }
                tokens.push(Tok::Or);
            }
            '(' => {
                chars.next();
                tokens.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Tok::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Tok::Comma);
            }
            '/' => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                while let Some((_, rc)) = chars.next() {
                    if rc == '\\' {
                        if let Some((_, escaped)) = chars.next() {
                            if escaped != '/' {
                                body.push('\\');
                            }
                            body.push(escaped);
                        }
                    } else if rc == '/' {
                        closed = true;
                        break;
                    } else {
                        body.push(rc);
                    }
                }
                if !closed {
                    return Err(invalid(expr, "unterminated regex literal"));
                }
                tokens.push(Tok::Regex(body));
            }
            c if c.is_ascii_digit() => {
                // Either a range `min..max` or a class name starting with a
                // digit; ranges only appear after a comma.
                let start = i;
                while let Some(&(_, nc)) = chars.peek() {
                    if nc.is_ascii_digit() || nc == '.' || nc.is_ascii_alphanumeric() || nc == '_' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let end = chars.peek().map(|&(j, _)| j).unwrap_or(expr.len());
                let text = &expr[start..end];
                if let Some((min, max)) = text.split_once("..") {
                    let min = min
                        .parse::<usize>()
                        .map_err(|_| invalid(expr, "bad range minimum"))?;
                    let max = max
                        .parse::<usize>()
                        .map_err(|_| invalid(expr, "bad range maximum"))?;
                    tokens.push(Tok::Range(min, max));
                } else {
                    tokens.push(Tok::Ident(text.to_string()));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while let Some(&(_, nc)) = chars.peek() {
                    if nc.is_ascii_alphanumeric() || nc == '_' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let end = chars.peek().map(|&(j, _)| j).unwrap_or(expr.len());
                tokens.push(Tok::Ident(expr[start..end].to_string()));
            }
            other => {
                return Err(invalid(expr, &format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

// ----------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------

struct ExprParser<'a> {
    expr: &'a str,
    tokens: Vec<Tok>,
    pos: usize,
}

impl ExprParser<'_> {
    fn parse_or(&mut self) -> Result<Node, EvalError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, EvalError> {
        let mut node = self.parse_unary()?;
        while self.peek() == Some(&Tok::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, EvalError> {
        if self.peek() == Some(&Tok::Not) {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, EvalError> {
        match self.next() {
            Some(Tok::LParen) => {
                let node = self.parse_or()?;
                self.expect(Tok::RParen)?;
                Ok(node)
            }
            Some(Tok::Ident(name)) if name == "class_matching" => {
                self.expect(Tok::LParen)?;
                let re = self.expect_regex()?;
                self.expect(Tok::RParen)?;
                Ok(Node::Matching(re))
            }
            Some(Tok::Ident(name)) if name == "class_count" => {
                self.expect(Tok::LParen)?;
                let re = self.expect_regex()?;
                self.expect(Tok::Comma)?;
                let (min, max) = match self.next() {
                    Some(Tok::Range(min, max)) => (min, max),
                    _ => return Err(invalid(self.expr, "class_count expects min..max")),
                };
                self.expect(Tok::RParen)?;
                Ok(Node::Count(re, min, max))
            }
            Some(Tok::Ident(name)) => Ok(Node::Class(name)),
            _ => Err(invalid(self.expr, "expected class term")),
        }
    }

    fn expect_regex(&mut self) -> Result<Regex, EvalError> {
        match self.next() {
            Some(Tok::Regex(body)) => {
                let anchored = format!("^(?:{})$", body);
                Regex::new(&anchored).map_err(|e| invalid(self.expr, &e.to_string()))
            }
            _ => Err(invalid(self.expr, "expected /regex/ literal")),
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), EvalError> {
        if self.next() == Some(tok) {
            Ok(())
        } else {
            Err(invalid(self.expr, "unexpected token"))
        }
    }

    fn expect_end(&mut self) -> Result<(), EvalError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(invalid(self.expr, "trailing tokens after expression"))
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }
}

fn invalid(expr: &str, reason: &str) -> EvalError {
    EvalError::ClassExpression {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}
