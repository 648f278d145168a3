//! Parser implementation
//!
//! Recursive descent over the token stream, producing the immutable
//! `accord_core::Policy` tree directly. Class guards are reassembled from
//! source text so the engine's class algebra sees exactly what was written.

use crate::lexer::{Lexer, Token, TokenKind};
use accord_core::{
    Body, Bundle, BundleType, Constraint, FnCall, Policy, PolicyError, Promise, PromiseType, Rval,
    Section, SourceLocation,
};
use std::path::Path;

/// Parse a policy file from disk.
pub fn parse_policy_file(path: &Path) -> Result<Policy, PolicyError> {
    let source = std::fs::read_to_string(path).map_err(|e| PolicyError::Parse {
        file: path.display().to_string(),
        line: 0,
        message: format!("cannot read: {}", e),
    })?;
    parse_policy(&source, &path.display().to_string())
}

/// Parse policy text. `file` is used for diagnostics and source locations.
/// Strict: the first error aborts the parse.
pub fn parse_policy(source: &str, file: &str) -> Result<Policy, PolicyError> {
    let tokens = Lexer::new(source).tokenize();
    let mut parser = Parser::new(source, file, tokens);
    let policy = parser.parse()?;
    policy.validate()?;
    Ok(policy)
}

/// Parse with promise-level recovery: a malformed promise is dropped and
/// reported, and parsing resumes at the next `;`. More than `max_errors`
/// accumulated diagnostics abort the load before execution.
pub fn parse_policy_resilient(
    source: &str,
    file: &str,
    max_errors: usize,
) -> Result<(Policy, Vec<PolicyError>), PolicyError> {
    let tokens = Lexer::new(source).tokenize();
    let mut parser = Parser::new(source, file, tokens);
    parser.recover = true;
    let policy = parser.parse()?;
    policy.validate()?;
    let errors = parser.recovered_errors;
    if errors.len() > max_errors {
        return Err(PolicyError::TooManyErrors {
            count: errors.len(),
        });
    }
    Ok((policy, errors))
}

/// Recursive-descent parser over a token stream.
pub struct Parser<'a> {
    source: &'a str,
    file: String,
    tokens: Vec<Token>,
    pos: usize,
    recover: bool,
    recovered_errors: Vec<PolicyError>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, file: &str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            file: file.to_string(),
            tokens,
            pos: 0,
            recover: false,
            recovered_errors: Vec::new(),
        }
    }

    /// Parse the whole token stream into a policy.
    pub fn parse(&mut self) -> Result<Policy, PolicyError> {
        let mut policy = Policy::new();

        loop {
            match &self.current().kind {
                TokenKind::Bundle => {
                    self.advance();
                    policy.bundles.push(self.parse_bundle()?);
                }
                TokenKind::Body => {
                    self.advance();
                    policy.bodies.push(self.parse_body()?);
                }
                TokenKind::Eof => break,
                other => {
                    return Err(self.error(&format!("Expected 'bundle' or 'body', found {:?}", other)))
                }
            }
        }

        Ok(policy)
    }

    // ------------------------------------------------------------------
    // Bundles
    // ------------------------------------------------------------------

    fn parse_bundle(&mut self) -> Result<Bundle, PolicyError> {
        let line = self.current().span.line;
        let type_keyword = self.expect_identifier()?;
        let bundle_type = BundleType::from_keyword(&type_keyword).ok_or_else(|| {
            PolicyError::UnknownBundleType {
                keyword: type_keyword.clone(),
                file: self.file.clone(),
                line,
            }
        })?;
        let name = self.expect_identifier()?;

        let mut bundle = Bundle::new(name, bundle_type);
        bundle.location = SourceLocation::new(&self.file, line);
        bundle.params = self.parse_optional_params()?;

        self.expect(TokenKind::LBrace)?;
        while !self.check(&TokenKind::RBrace) {
            bundle.sections.push(self.parse_section()?);
        }
        self.expect(TokenKind::RBrace)?;

        Ok(bundle)
    }

    fn parse_section(&mut self) -> Result<Section, PolicyError> {
        let line = self.current().span.line;
        let keyword = self.expect_identifier()?;
        let promise_type = PromiseType::from_keyword(&keyword).ok_or_else(|| {
            PolicyError::UnknownPromiseType {
                keyword: keyword.clone(),
                file: self.file.clone(),
                line,
            }
        })?;
        self.expect(TokenKind::Colon)?;

        let mut promises = Vec::new();
        let mut guard = "any".to_string();

        loop {
            match &self.current().kind {
                // Section ends at the bundle's closing brace or the next
                // `ident:` section header.
                TokenKind::RBrace | TokenKind::Eof => break,
                TokenKind::Identifier(_) if self.peek_is_section_header() => break,

                TokenKind::String(_) => match self.parse_promise(&guard) {
                    Ok(promise) => promises.push(promise),
                    Err(e) if self.recover => {
                        self.recovered_errors.push(e);
                        self.skip_past_semicolon();
                    }
                    Err(e) => return Err(e),
                },

                // Anything else before a `::` is a class guard.
                _ => {
                    guard = self.parse_guard_text()?;
                }
            }
        }

        Ok(Section {
            promise_type,
            promises,
        })
    }

    fn parse_promise(&mut self, guard: &str) -> Result<Promise, PolicyError> {
        let line = self.current().span.line;
        let promiser = self.expect_string()?;

        let mut promise = Promise::new(promiser);
        promise.guard = guard.to_string();
        promise.location = SourceLocation::new(&self.file, line);

        if self.check(&TokenKind::ThinArrow) {
            self.advance();
            promise.promisee = Some(self.parse_rval()?);
        }

        if !self.check(&TokenKind::Semicolon) {
            loop {
                let lval = self.expect_identifier()?;
                self.expect(TokenKind::FatArrow)?;
                let rval = self.parse_rval()?;
                promise.constraints.push(Constraint::new(lval, rval));
                if self.check(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::Semicolon)?;

        Ok(promise)
    }

    /// Drop tokens until just after the next `;`, staying inside the
    /// current bundle. Used for promise-level error recovery.
    fn skip_past_semicolon(&mut self) {
        loop {
            match &self.current().kind {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace | TokenKind::Eof => return,
                _ => self.advance(),
            }
        }
    }

    /// A guard is everything up to the `::` separator, reproduced from the
    /// source text.
    fn parse_guard_text(&mut self) -> Result<String, PolicyError> {
        let start = self.current().span.start;
        loop {
            match &self.current().kind {
                TokenKind::DoubleColon => {
                    let end = self.current().span.start;
                    self.advance();
                    return Ok(self.source[start..end].trim().to_string());
                }
                TokenKind::Eof | TokenKind::RBrace | TokenKind::Semicolon => {
                    return Err(self.error("Expected '::' to end class guard"));
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// True when the current identifier is a `sectionname:` header rather
    /// than the start of a class guard.
    fn peek_is_section_header(&self) -> bool {
        if let TokenKind::Identifier(name) = &self.current().kind {
            if PromiseType::from_keyword(name).is_some() {
                return matches!(self.peek_kind(1), Some(TokenKind::Colon));
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Bodies
    // ------------------------------------------------------------------

    fn parse_body(&mut self) -> Result<Body, PolicyError> {
        let line = self.current().span.line;
        let body_type = self.expect_identifier()?;
        let name = self.expect_identifier()?;

        let mut body = Body::new(name, body_type);
        body.location = SourceLocation::new(&self.file, line);
        body.params = self.parse_optional_params()?;

        self.expect(TokenKind::LBrace)?;
        while !self.check(&TokenKind::RBrace) {
            let lval = self.expect_identifier()?;
            self.expect(TokenKind::FatArrow)?;
            let rval = self.parse_rval()?;
            self.expect(TokenKind::Semicolon)?;

            if lval == "inherit_from" {
                match &rval {
                    Rval::Scalar(parent) => body.inherit_from = Some(parent.clone()),
                    Rval::FnCall(call) => body.inherit_from = Some(call.name.clone()),
                    _ => return Err(self.error("inherit_from expects a body name")),
                }
            } else {
                body.constraints.push(Constraint::new(lval, rval));
            }
        }
        self.expect(TokenKind::RBrace)?;

        Ok(body)
    }

    // ------------------------------------------------------------------
    // Rvalues
    // ------------------------------------------------------------------

    fn parse_rval(&mut self) -> Result<Rval, PolicyError> {
        match self.current().kind.clone() {
            TokenKind::String(s) => {
                self.advance();
                Ok(Rval::Scalar(s))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Rval::Scalar(n))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if self.check(&TokenKind::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    while !self.check(&TokenKind::RParen) {
                        args.push(self.parse_rval()?);
                        if self.check(&TokenKind::Comma) {
                            self.advance();
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    Ok(Rval::FnCall(FnCall::new(name, args)))
                } else {
                    // Body references and naked `@(x)` list references both
                    // land here as scalar text.
                    Ok(Rval::Scalar(name))
                }
            }
            TokenKind::LBrace => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    items.push(self.parse_rval()?);
                    if self.check(&TokenKind::Comma) {
                        self.advance();
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Rval::List(items))
            }
            other => Err(self.error(&format!("Expected rvalue, found {:?}", other))),
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + ahead).map(|t| &t.kind)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), PolicyError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!(
                "Expected {:?}, found {:?}",
                kind,
                self.current().kind
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, PolicyError> {
        match self.current().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(&format!("Expected identifier, found {:?}", other))),
        }
    }

    fn expect_string(&mut self) -> Result<String, PolicyError> {
        match self.current().kind.clone() {
            TokenKind::String(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(self.error(&format!("Expected string, found {:?}", other))),
        }
    }

    fn parse_optional_params(&mut self) -> Result<Vec<String>, PolicyError> {
        let mut params = Vec::new();
        if self.check(&TokenKind::LParen) {
            self.advance();
            while !self.check(&TokenKind::RParen) {
                params.push(self.expect_identifier()?);
                if self.check(&TokenKind::Comma) {
                    self.advance();
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        Ok(params)
    }

    fn error(&self, message: &str) -> PolicyError {
        PolicyError::Parse {
            file: self.file.clone(),
            line: self.current().span.line,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vars_and_reports() {
        let policy = parse_policy(
            r#"
            bundle agent main
            {
              vars:
                "x" string => "world";

              reports:
                "hello $(x)";
            }
            "#,
            "test.acc",
        )
        .expect("parse should succeed");

        assert_eq!(policy.bundles.len(), 1);
        let bundle = &policy.bundles[0];
        assert_eq!(bundle.name, "main");
        assert_eq!(bundle.bundle_type, BundleType::Agent);
        assert_eq!(bundle.sections.len(), 2);
        assert_eq!(bundle.sections[0].promise_type, PromiseType::Vars);
        let var = &bundle.sections[0].promises[0];
        assert_eq!(var.promiser, "x");
        assert_eq!(var.constraint("string"), Some(&Rval::scalar("world")));
        assert_eq!(bundle.sections[1].promises[0].promiser, "hello $(x)");
    }

    #[test]
    fn test_parse_class_guards() {
        let policy = parse_policy(
            r#"
            bundle agent main
            {
              reports:
                ok.!bad::
                  "reached";
                any::
                  "always";
            }
            "#,
            "test.acc",
        )
        .expect("parse should succeed");

        let section = &policy.bundles[0].sections[0];
        assert_eq!(section.promises[0].guard, "ok.!bad");
        assert_eq!(section.promises[1].guard, "any");
    }

    #[test]
    fn test_parse_lists_and_fncalls() {
        let policy = parse_policy(
            r#"
            bundle agent main
            {
              vars:
                "l" slist => { "a", "b" };
                "c" string => canonify("x-y");
                "m" slist => maplist(canonify("$(this.k)"), @(l));
            }
            "#,
            "test.acc",
        )
        .expect("parse should succeed");

        let vars = &policy.bundles[0].sections[0].promises;
        assert_eq!(
            vars[0].constraint("slist"),
            Some(&Rval::slist(["a", "b"]))
        );
        assert!(matches!(vars[1].constraint("string"), Some(Rval::FnCall(_))));
        match vars[2].constraint("slist") {
            Some(Rval::FnCall(call)) => {
                assert_eq!(call.name, "maplist");
                assert_eq!(call.args[1], Rval::scalar("@(l)"));
            }
            other => panic!("expected maplist call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_body_with_inheritance() {
        let policy = parse_policy(
            r#"
            body action base
            {
              ifelapsed => "60";
            }
            body action quick
            {
              inherit_from => base;
              ifelapsed => "1";
            }
            bundle agent main
            {
              commands:
                "/bin/true" action => quick;
            }
            "#,
            "test.acc",
        )
        .expect("parse should succeed");

        let merged = policy
            .resolve_body_constraints("action", "quick")
            .expect("resolution should succeed");
        assert_eq!(
            merged.iter().find(|c| c.lval == "ifelapsed").map(|c| &c.rval),
            Some(&Rval::scalar("1"))
        );
    }

    #[test]
    fn test_parse_bundle_params_and_promisee() {
        let policy = parse_policy(
            r#"
            bundle agent configure(target, mode)
            {
              files:
                "$(target)" -> "ops-team",
                  create => "true";
            }
            "#,
            "test.acc",
        )
        .expect("parse should succeed");

        let bundle = &policy.bundles[0];
        assert_eq!(bundle.params, vec!["target", "mode"]);
        let promise = &bundle.sections[0].promises[0];
        assert_eq!(promise.promisee, Some(Rval::scalar("ops-team")));
        assert_eq!(promise.constraint("create"), Some(&Rval::scalar("true")));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let err = parse_policy(
            "bundle agent main { widgets: \"x\"; }",
            "test.acc",
        )
        .expect_err("parse should fail");
        assert!(matches!(err, PolicyError::UnknownPromiseType { .. }));
    }

    #[test]
    fn test_missing_semicolon_rejected() {
        let err = parse_policy(
            "bundle agent main { reports: \"x\" }",
            "test.acc",
        )
        .expect_err("parse should fail");
        assert!(matches!(err, PolicyError::Parse { .. }));
    }

    #[test]
    fn test_resilient_drops_bad_promise_and_continues() {
        let (policy, errors) = parse_policy_resilient(
            r#"
            bundle agent main
            {
              reports:
                "good one";
                "broken" stray stray;
                "good two";
            }
            "#,
            "test.acc",
            4,
        )
        .expect("resilient parse should succeed");

        assert_eq!(errors.len(), 1);
        let promisers: Vec<&str> = policy.bundles[0].sections[0]
            .promises
            .iter()
            .map(|p| p.promiser.as_str())
            .collect();
        assert_eq!(promisers, vec!["good one", "good two"]);
    }

    #[test]
    fn test_resilient_aborts_past_error_threshold() {
        let err = parse_policy_resilient(
            r#"
            bundle agent main
            {
              reports:
                "a" x x;
                "b" y y;
            }
            "#,
            "test.acc",
            1,
        )
        .expect_err("parse should abort");
        assert!(matches!(err, PolicyError::TooManyErrors { count: 2 }));
    }
}
