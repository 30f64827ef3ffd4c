//! Recursive-descent parser for HDQL.
//!
//! Precedence, loosest first:
//!
//! ```text
//! or_expr   := and_expr ( OR and_expr )*
//! and_expr  := not_expr ( AND not_expr )*
//! not_expr  := NOT not_expr | rel_expr
//! rel_expr  := analogy ( ("->" | "-[rel]->") analogy )*
//! analogy   := postfix ( is_to postfix as postfix is_to target )?
//! postfix   := primary ( "." field cmp literal )?
//! primary   := "(" or_expr ")" | similar_to(...) | maximize(...) | minimize(...)
//!            | field cmp literal | type "(" id "~"? ")"
//! ```

use crate::ast::*;
use crate::error::{ParseError, Position};
use crate::lexer::{tokenize, Spanned, Token};

/// Parameters accepted by `similar_to(...)`.
pub const SIMILARITY_PARAMS: &[&str] = &["distance", "top_k", "type"];

pub fn parse_query(input: &str) -> Result<Query, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser::new(tokens);
    let query = parser.parse_or()?;
    parser.expect_end()?;
    Ok(query)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, pos: 0 }
    }

    // ------------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------------

    fn current(&self) -> &Spanned {
        // The lexer always terminates the stream with `Eof`.
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + ahead).min(last)].token
    }

    fn position(&self) -> Position {
        self.current().position
    }

    fn bump(&mut self) -> Spanned {
        let spanned = self.current().clone();
        if spanned.token != Token::Eof {
            self.pos += 1;
        }
        spanned
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.bump();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &[&str]) -> ParseError {
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();
        expected.dedup();
        let current = self.current();
        match &current.token {
            Token::Eof => ParseError::UnexpectedEnd {
                expected,
                position: current.position,
            },
            other => ParseError::UnexpectedToken {
                found: other.to_string(),
                expected,
                position: current.position,
            },
        }
    }

    fn expect(&mut self, token: Token, label: &str) -> Result<Spanned, ParseError> {
        if *self.peek() == token {
            Ok(self.bump())
        } else {
            Err(self.unexpected(&[label]))
        }
    }

    /// Closes a parenthesis opened at `open`; running out of input is reported
    /// as an unmatched parenthesis rather than a generic syntax error.
    fn close_paren(&mut self, open: Position, expected: &[&str]) -> Result<(), ParseError> {
        match self.peek() {
            Token::RParen => {
                self.bump();
                Ok(())
            }
            Token::Eof => Err(ParseError::UnmatchedParen { position: open }),
            _ => {
                let mut labels = expected.to_vec();
                labels.push("`)`");
                Err(self.unexpected(&labels))
            }
        }
    }

    fn expect_end(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            Token::Eof => Ok(()),
            Token::RParen => Err(ParseError::UnmatchedParen {
                position: self.position(),
            }),
            _ => Err(self.unexpected(&[
                "`AND`",
                "`OR`",
                "`->`",
                "`is_to`",
                "`.`",
                "end of query",
            ])),
        }
    }

    fn expect_ident(&mut self, label: &str) -> Result<(String, Position), ParseError> {
        let position = self.position();
        match self.peek().clone() {
            Token::Ident(name) => {
                self.bump();
                Ok((name, position))
            }
            _ => Err(self.unexpected(&[label])),
        }
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn parse_or(&mut self) -> Result<Query, ParseError> {
        let first = self.parse_and()?;
        let mut operands = vec![first];
        while self.eat(&Token::Or) {
            operands.push(self.parse_and()?);
        }
        Ok(fold_logical(LogicalOp::Or, operands))
    }

    fn parse_and(&mut self) -> Result<Query, ParseError> {
        let first = self.parse_not()?;
        let mut operands = vec![first];
        while self.eat(&Token::And) {
            operands.push(self.parse_not()?);
        }
        Ok(fold_logical(LogicalOp::And, operands))
    }

    fn parse_not(&mut self) -> Result<Query, ParseError> {
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Query::Logical(Logical {
                op: LogicalOp::Not,
                operands: vec![operand],
            }));
        }
        self.parse_relational()
    }

    fn parse_relational(&mut self) -> Result<Query, ParseError> {
        let mut left = self.parse_analogy()?;
        loop {
            let relation = match self.peek().clone() {
                Token::Arrow => None,
                Token::NamedArrow(name) => Some(name),
                _ => return Ok(left),
            };
            self.bump();
            let right = self.parse_analogy()?;
            left = Query::Relational(Relational {
                left: Box::new(left),
                relation,
                right: Box::new(right),
            });
        }
    }

    fn parse_analogy(&mut self) -> Result<Query, ParseError> {
        let a = self.parse_postfix()?;
        if !self.eat(&Token::IsTo) {
            return Ok(a);
        }
        let b = self.parse_postfix()?;
        self.expect(Token::As, "`as`")?;
        let c = self.parse_postfix()?;
        self.expect(Token::IsTo, "`is_to`")?;
        let target_type = self.parse_analogy_target()?;
        Ok(Query::Analogy(Analogy {
            a: Box::new(a),
            b: Box::new(b),
            c: Box::new(c),
            target_type,
        }))
    }

    fn parse_analogy_target(&mut self) -> Result<Option<String>, ParseError> {
        match self.peek().clone() {
            Token::Question => {
                self.bump();
                Ok(None)
            }
            Token::Ident(name) => {
                self.bump();
                let open = self.expect(Token::LParen, "`(`")?.position;
                self.expect(Token::Question, "`?`")?;
                self.close_paren(open, &[])?;
                Ok(Some(name))
            }
            _ => Err(self.unexpected(&["`?`", "entity type"])),
        }
    }

    fn parse_postfix(&mut self) -> Result<Query, ParseError> {
        let primary = self.parse_primary()?;
        if *self.peek() != Token::Dot {
            return Ok(primary);
        }
        self.bump();
        let (field, _) = self.expect_ident("field name")?;
        let comparison = self.parse_comparison_tail(field)?;
        Ok(Query::Logical(Logical {
            op: LogicalOp::And,
            operands: vec![primary, Query::Comparison(comparison)],
        }))
    }

    fn parse_primary(&mut self) -> Result<Query, ParseError> {
        let position = self.position();
        match self.peek().clone() {
            Token::LParen => {
                self.bump();
                let inner = self.parse_or()?;
                self.close_paren(position, &["`AND`", "`OR`", "`->`", "`is_to`"])?;
                Ok(inner)
            }
            Token::SimilarTo => self.parse_similarity(),
            Token::Maximize | Token::Minimize => self.parse_optimization(),
            Token::Ident(name) => {
                if self.peek_at(1).is_comparison() {
                    self.bump();
                    return Ok(Query::Comparison(self.parse_comparison_tail(name)?));
                }
                if *self.peek_at(1) == Token::LParen {
                    return self.parse_atomic(name, position);
                }
                self.bump();
                Err(self.unexpected(&["`(`", "comparison operator"]))
            }
            _ => Err(self.unexpected(&[
                "`(`",
                "`NOT`",
                "`similar_to`",
                "`maximize`",
                "`minimize`",
                "entity lookup",
                "comparison",
            ])),
        }
    }

    /// `type(arg)` where `arg` is a string, a bare identifier or `*`. Nested
    /// calls, several arguments and keyword arguments name a function the
    /// language does not have; a malformed argument is an unexpected token.
    fn parse_atomic(&mut self, name: String, position: Position) -> Result<Query, ParseError> {
        self.bump();
        let open = self.bump().position;
        let unknown = |name: String| ParseError::UnknownFunction { name, position };

        let identifier = match self.peek().clone() {
            Token::Str(s) | Token::Ident(s) => s,
            Token::Star => Atomic::WILDCARD.to_string(),
            Token::Eof => return Err(ParseError::UnmatchedParen { position: open }),
            Token::RParen | Token::Comma | Token::Number(_) | Token::Tilde | Token::Question => {
                return Err(self.unexpected(&["string", "identifier", "`*`"]))
            }
            _ => return Err(unknown(name)),
        };
        self.bump();
        let fuzzy = self.eat(&Token::Tilde);

        match self.peek() {
            Token::RParen => {
                self.bump();
                Ok(Query::Atomic(Atomic {
                    entity_type: name,
                    identifier,
                    fuzzy,
                }))
            }
            Token::Eof => Err(ParseError::UnmatchedParen { position: open }),
            Token::Str(_)
            | Token::Ident(_)
            | Token::Number(_)
            | Token::Star
            | Token::Question
            | Token::Tilde => {
                let expected: &[&str] = if fuzzy { &["`)`"] } else { &["`)`", "`~`"] };
                Err(self.unexpected(expected))
            }
            _ => Err(unknown(name)),
        }
    }

    fn parse_comparison_tail(&mut self, field: String) -> Result<Comparison, ParseError> {
        let op = match self.peek() {
            Token::Lt => CmpOp::Lt,
            Token::Le => CmpOp::Le,
            Token::Gt => CmpOp::Gt,
            Token::Ge => CmpOp::Ge,
            Token::EqEq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            _ => return Err(self.unexpected(&["comparison operator"])),
        };
        self.bump();
        let value = self.parse_literal()?;
        Ok(Comparison { field, op, value })
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        let negative = self.eat(&Token::Minus);
        let literal = match self.peek().clone() {
            Token::Number(n) => Literal::Number(if negative { -n } else { n }),
            Token::Str(s) if !negative => Literal::Text(s),
            Token::True if !negative => Literal::Bool(true),
            Token::False if !negative => Literal::Bool(false),
            _ if negative => return Err(self.unexpected(&["number"])),
            _ => return Err(self.unexpected(&["number", "string", "`true`", "`false`"])),
        };
        self.bump();
        Ok(literal)
    }

    fn parse_similarity(&mut self) -> Result<Query, ParseError> {
        self.bump();
        let open = self.expect(Token::LParen, "`(`")?.position;
        let target = self.parse_or()?;

        let mut similarity = Similarity {
            target: Box::new(target),
            distance: None,
            top_k: None,
            target_type: None,
        };

        while self.eat(&Token::Comma) {
            let (name, position) = self.expect_ident("parameter name")?;
            if !SIMILARITY_PARAMS.contains(&name.as_str()) {
                return Err(ParseError::UnknownParameter {
                    name,
                    function: "similar_to".to_string(),
                    position,
                });
            }
            self.expect(Token::Assign, "`=`")?;
            let value_position = self.position();
            let value = self.parse_param_value()?;
            let invalid = |message: &str| ParseError::InvalidParameter {
                name: name.clone(),
                message: message.to_string(),
                position: value_position,
            };
            match (name.as_str(), value) {
                ("distance", Literal::Number(d)) => {
                    if !(0.0..=2.0).contains(&d) {
                        return Err(invalid("cosine distance must lie in [0, 2]"));
                    }
                    similarity.distance = Some(d);
                }
                ("top_k", Literal::Number(k)) => {
                    if k < 1.0 || k.fract() != 0.0 || k > u32::MAX as f64 {
                        return Err(invalid("expected a positive integer"));
                    }
                    similarity.top_k = Some(k as usize);
                }
                ("type", Literal::Text(t)) => similarity.target_type = Some(t),
                ("distance", _) | ("top_k", _) => return Err(invalid("expected a number")),
                _ => return Err(invalid("expected an entity type name")),
            }
        }

        self.close_paren(open, &["`,`"])?;
        Ok(Query::Similarity(similarity))
    }

    /// Parameter values accept bare identifiers as strings (`type=job`).
    fn parse_param_value(&mut self) -> Result<Literal, ParseError> {
        if let Token::Ident(name) = self.peek().clone() {
            self.bump();
            return Ok(Literal::Text(name));
        }
        self.parse_literal()
    }

    fn parse_optimization(&mut self) -> Result<Query, ParseError> {
        let direction = match self.bump().token {
            Token::Minimize => Direction::Minimize,
            _ => Direction::Maximize,
        };
        let open = self.expect(Token::LParen, "`(`")?.position;
        let objective = self.parse_objective()?;
        self.close_paren(open, &["`+`", "`-`", "`*`"])?;

        let mut constraints = Vec::new();
        if self.eat(&Token::SubjectTo) {
            let open = self.expect(Token::LParen, "`(`")?.position;
            loop {
                let (field, _) = self.expect_ident("constraint field")?;
                constraints.push(self.parse_comparison_tail(field)?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.close_paren(open, &["`,`"])?;
        }

        Ok(Query::Optimization(Optimization {
            direction,
            objective,
            constraints,
        }))
    }

    fn parse_objective(&mut self) -> Result<Objective, ParseError> {
        let mut terms = vec![self.parse_term()?];
        loop {
            let sign = match self.peek() {
                Token::Plus => 1.0,
                Token::Minus => -1.0,
                _ => break,
            };
            self.bump();
            let mut term = self.parse_term()?;
            term.weight *= sign;
            terms.push(term);
        }
        Ok(Objective { terms })
    }

    fn parse_term(&mut self) -> Result<ObjectiveTerm, ParseError> {
        match self.peek().clone() {
            Token::Minus => {
                self.bump();
                let mut term = self.parse_term()?;
                term.weight = -term.weight;
                Ok(term)
            }
            Token::Number(weight) => {
                self.bump();
                self.expect(Token::Star, "`*`")?;
                let (field, _) = self.expect_ident("field name")?;
                Ok(ObjectiveTerm { field, weight })
            }
            Token::Ident(field) => {
                self.bump();
                let mut weight = 1.0;
                if self.eat(&Token::Star) {
                    match self.peek().clone() {
                        Token::Number(w) => {
                            self.bump();
                            weight = w;
                        }
                        _ => return Err(self.unexpected(&["number"])),
                    }
                }
                Ok(ObjectiveTerm { field, weight })
            }
            _ => Err(self.unexpected(&["field name", "number", "`-`"])),
        }
    }
}

fn fold_logical(op: LogicalOp, mut operands: Vec<Query>) -> Query {
    if operands.len() == 1 {
        if let Some(only) = operands.pop() {
            return only;
        }
    }
    Query::Logical(Logical { op, operands })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atomic(t: &str, id: &str) -> Query {
        Query::Atomic(Atomic {
            entity_type: t.into(),
            identifier: id.into(),
            fuzzy: false,
        })
    }

    #[test]
    fn parses_atomic_variants() {
        assert_eq!(parse_query(r#"command("deps")"#).unwrap(), atomic("command", "deps"));
        assert_eq!(parse_query("command(*)").unwrap(), atomic("command", "*"));
        assert_eq!(parse_query("job(python-dev)").unwrap(), atomic("job", "python-dev"));
        let Query::Atomic(fuzzy) = parse_query(r#"command("dpes"~)"#).unwrap() else {
            panic!("expected atomic");
        };
        assert!(fuzzy.fuzzy);
    }

    #[test]
    fn logical_binds_looser_than_arrow() {
        let q = parse_query(r#"command("*") -> job("x") AND NOT feature("y")"#).unwrap();
        let Query::Logical(and) = q else {
            panic!("expected AND at the root");
        };
        assert_eq!(and.op, LogicalOp::And);
        assert!(matches!(and.operands[0], Query::Relational(_)));
        assert!(matches!(
            &and.operands[1],
            Query::Logical(Logical { op: LogicalOp::Not, .. })
        ));
    }

    #[test]
    fn or_binds_looser_than_and() {
        let q = parse_query("a(x) OR b(y) AND c(z)").unwrap();
        let Query::Logical(or) = q else {
            panic!("expected OR");
        };
        assert_eq!(or.op, LogicalOp::Or);
        assert!(matches!(&or.operands[1], Query::Logical(l) if l.op == LogicalOp::And));
    }

    #[test]
    fn named_relation_arrow() {
        let Query::Relational(r) = parse_query(r#"command("*") -[serves]-> job("x")"#).unwrap()
        else {
            panic!("expected relational");
        };
        assert_eq!(r.relation.as_deref(), Some("serves"));
    }

    #[test]
    fn similarity_parameters() {
        let Query::Similarity(s) =
            parse_query(r#"similar_to(command("deps"), distance=0.2, top_k=5, type=job)"#)
                .unwrap()
        else {
            panic!("expected similarity");
        };
        assert_eq!(s.distance, Some(0.2));
        assert_eq!(s.top_k, Some(5));
        assert_eq!(s.target_type.as_deref(), Some("job"));
    }

    #[test]
    fn analogy_with_and_without_target() {
        let q = parse_query(r#"command("a") is_to feature("b") as command("c") is_to ?"#).unwrap();
        assert!(matches!(q, Query::Analogy(Analogy { target_type: None, .. })));
        let q = parse_query(r#"command("a") is_to feature("b") as command("c") is_to feature(?)"#)
            .unwrap();
        let Query::Analogy(a) = q else {
            panic!("expected analogy");
        };
        assert_eq!(a.target_type.as_deref(), Some("feature"));
    }

    #[test]
    fn optimization_with_weighted_terms() {
        let Query::Optimization(o) =
            parse_query("maximize(coverage - 0.3 * effort + 2 * impact) subject_to(effort <= 10, risk < 3)")
                .unwrap()
        else {
            panic!("expected optimization");
        };
        let weights: Vec<f64> = o.objective.terms.iter().map(|t| t.weight).collect();
        assert_eq!(weights, vec![1.0, -0.3, 2.0]);
        assert_eq!(o.constraints.len(), 2);
        assert_eq!(o.constraints[1].op, CmpOp::Lt);
    }

    #[test]
    fn dotted_comparison_desugars_to_and() {
        let q = parse_query(r#"feature("*").coverage >= 0.8"#).unwrap();
        assert_eq!(q.to_string(), r#"(feature("*") AND coverage >= 0.8)"#);
    }

    #[test]
    fn negative_literal() {
        let Query::Comparison(c) = parse_query("delta > -1.5").unwrap() else {
            panic!("expected comparison");
        };
        assert_eq!(c.value, Literal::Number(-1.5));
    }

    #[test]
    fn unknown_function_is_named() {
        let err = parse_query(r#"count(command("x"))"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownFunction { ref name, .. } if name == "count"));
        let err = parse_query(r#"lookup("a", "b")"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownFunction { .. }));
    }

    #[test]
    fn unquoted_globs_are_lookups() {
        assert_eq!(parse_query("command(dep*)").unwrap(), atomic("command", "dep*"));
        assert_eq!(parse_query("command(b?ild)").unwrap(), atomic("command", "b?ild"));
    }

    #[test]
    fn malformed_lookup_argument_is_an_unexpected_token() {
        let err = parse_query("command(dep *)").unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedToken { ref expected, .. } if expected.contains(&"`)`".to_string())
        ));
        let err = parse_query("command()").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedToken { .. }));
        let err = parse_query("command(42)").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedToken { .. }));
    }

    #[test]
    fn unmatched_parens_are_named() {
        let err = parse_query(r#"(command("x") AND job("y")"#).unwrap_err();
        assert_eq!(err, ParseError::UnmatchedParen { position: Position::START });
        let err = parse_query(r#"command("x"))"#).unwrap_err();
        assert!(matches!(err, ParseError::UnmatchedParen { .. }));
    }

    #[test]
    fn syntax_error_lists_expected_tokens() {
        let err = parse_query(r#"command("x") AND"#).unwrap_err();
        let ParseError::UnexpectedEnd { expected, .. } = err else {
            panic!("expected UnexpectedEnd, got {err:?}");
        };
        assert!(expected.iter().any(|e| e == "`similar_to`"));

        let err = parse_query(r#"command("x") job("y")"#).unwrap_err();
        let ParseError::UnexpectedToken { found, position, .. } = err else {
            panic!("expected UnexpectedToken");
        };
        assert_eq!(found, "identifier `job`");
        assert_eq!(position.column, 14);
    }

    #[test]
    fn unknown_similarity_parameter() {
        let err = parse_query(r#"similar_to(command("x"), metric=cosine)"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownParameter { ref name, .. } if name == "metric"));
    }

    #[test]
    fn invalid_top_k() {
        let err = parse_query(r#"similar_to(command("x"), top_k=0)"#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidParameter { .. }));
    }
}
