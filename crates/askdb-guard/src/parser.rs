//! Recursive-descent parser for a single SELECT statement.
//!
//! Only the read surface is modelled: SELECT with CTEs, set operations,
//! joins, derived tables and expression subqueries. Anything that starts a
//! query position with another verb is reported as [`ParseErrorKind::NotAQuery`]
//! so callers can tell "not a read" apart from "could not parse".

use crate::ast::*;
use crate::token::{Span, Token, TokenKind};

const MAX_DEPTH: usize = 64;
/// Binary operators and `::` casts allowed in one statement. Operator chains
/// build left-deep trees that every later pass walks recursively.
const MAX_OPERATORS: usize = 512;

/// Words that end a FROM item instead of naming an implicit alias.
const NON_ALIAS_WORDS: [&str; 9] = [
    "for",
    "natural",
    "lateral",
    "fetch",
    "window",
    "returning",
    "format",
    "settings",
    "qualify",
];

const TIME_UNITS: [&str; 8] = [
    "year", "quarter", "month", "week", "day", "hour", "minute", "second",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    Syntax,
    /// A query position holds something other than SELECT (INSERT, DELETE,
    /// SELECT INTO, locking clauses, ...).
    NotAQuery,
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
    pub expected: Vec<String>,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            expected: Vec::new(),
            kind: ParseErrorKind::Syntax,
        }
    }

    pub fn not_a_query(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: ParseErrorKind::NotAQuery,
            ..Self::new(message, span)
        }
    }

    pub fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected.push(expected.into());
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parse error at line {}, column {}: {}",
            self.span.line, self.span.column, self.message
        )?;
        if !self.expected.is_empty() {
            write!(f, " (expected: {})", self.expected.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    operators: usize,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if !matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::Eof)) {
            let span = tokens.last().map(|t| t.span).unwrap_or_default();
            tokens.push(Token::new(TokenKind::Eof, span, ""));
        }
        Self {
            tokens,
            pos: 0,
            depth: 0,
            operators: 0,
        }
    }

    /// Parse exactly one query, allowing a single trailing semicolon.
    pub fn parse_single_query(mut self) -> Result<Query, ParseError> {
        let query = self.parse_query()?;
        self.match_token(&TokenKind::Semicolon);
        if self.peek_word("for") {
            return Err(ParseError::not_a_query(
                "Row locking clauses are not allowed",
                self.current_span(),
            ));
        }
        if !self.is_at_end() {
            return Err(ParseError::new(
                format!("Unexpected {} after end of query", self.peek().kind),
                self.current_span(),
            ));
        }
        Ok(query)
    }

    // ========== Helper Methods ==========

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_nth(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.is_at_end() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn check_nth(&self, n: usize, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek_nth(n).kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParseError::new(
                format!("{message}, found {}", self.peek().kind),
                self.current_span(),
            )
            .expected(kind.to_string()))
        }
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Identifier(w) if w.eq_ignore_ascii_case(word))
    }

    fn is_identifier_at(&self, n: usize) -> bool {
        matches!(
            self.peek_nth(n).kind,
            TokenKind::Identifier(_) | TokenKind::QuotedIdentifier { .. }
        )
    }

    fn starts_query(&self) -> bool {
        self.check(&TokenKind::Select) || self.check(&TokenKind::With)
    }

    fn expect_identifier(&mut self, message: &str) -> Result<Ident, ParseError> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let ident = Ident::new(name.clone());
                self.advance();
                Ok(ident)
            }
            TokenKind::QuotedIdentifier { value, quote } => {
                let ident = Ident::quoted(value.clone(), *quote);
                self.advance();
                Ok(ident)
            }
            other => Err(ParseError::new(
                format!("{message}, found {other}"),
                self.current_span(),
            )
            .expected("identifier")),
        }
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::new(
                "Query nesting is too deep",
                self.current_span(),
            ));
        }
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn count_operator(&mut self) -> Result<(), ParseError> {
        self.operators += 1;
        if self.operators > MAX_OPERATORS {
            return Err(ParseError::new(
                "Query has too many operators",
                self.current_span(),
            ));
        }
        Ok(())
    }

    // ========== Query Parsing ==========

    fn parse_query(&mut self) -> Result<Query, ParseError> {
        self.nested(|p| p.parse_query_inner())
    }

    fn parse_query_inner(&mut self) -> Result<Query, ParseError> {
        let with = if self.match_token(&TokenKind::With) {
            Some(self.parse_with()?)
        } else {
            None
        };
        let body = self.parse_set_expr()?;

        let order_by = if self.match_token(&TokenKind::Order) {
            self.expect(&TokenKind::By, "Expected BY after ORDER")?;
            self.parse_order_by_list()?
        } else {
            Vec::new()
        };

        let mut limit = None;
        let mut offset = None;
        let mut limit_seen = false;
        loop {
            if self.check(&TokenKind::Limit) {
                if limit_seen {
                    return Err(ParseError::new("Duplicate LIMIT", self.current_span()));
                }
                self.advance();
                limit_seen = true;
                if self.match_token(&TokenKind::All) {
                    continue;
                }
                let first = self.parse_expr()?;
                if self.match_token(&TokenKind::Comma) {
                    // LIMIT <offset>, <count>
                    offset = Some(first);
                    limit = Some(self.parse_expr()?);
                } else {
                    limit = Some(first);
                }
                continue;
            }
            if self.check(&TokenKind::Offset) {
                if offset.is_some() {
                    return Err(ParseError::new("Duplicate OFFSET", self.current_span()));
                }
                self.advance();
                offset = Some(self.parse_expr()?);
                if self.peek_word("row") || self.peek_word("rows") {
                    self.advance();
                }
                continue;
            }
            break;
        }

        Ok(Query {
            with,
            body,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_with(&mut self) -> Result<With, ParseError> {
        let recursive = self.match_token(&TokenKind::Recursive);
        let mut ctes = Vec::new();
        loop {
            let name = self.expect_identifier("Expected CTE name")?;
            let columns = if self.check(&TokenKind::LParen) {
                self.parse_parenthesized_idents()?
            } else {
                Vec::new()
            };
            self.expect(&TokenKind::As, "Expected AS after CTE name")?;
            self.expect(&TokenKind::LParen, "Expected '(' before CTE body")?;
            let query = self.parse_query()?;
            self.expect(&TokenKind::RParen, "Expected ')' after CTE body")?;
            ctes.push(Cte {
                name,
                columns,
                query: Box::new(query),
            });
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        Ok(With { recursive, ctes })
    }

    fn parse_set_expr(&mut self) -> Result<SetExpr, ParseError> {
        let mut left = self.parse_intersect_expr()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Union => SetOperator::Union,
                TokenKind::Except => SetOperator::Except,
                _ => break,
            };
            self.advance();
            let all = self.parse_set_quantifier();
            let right = self.parse_intersect_expr()?;
            left = SetExpr::SetOperation {
                op,
                all,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_intersect_expr(&mut self) -> Result<SetExpr, ParseError> {
        let mut left = self.parse_set_primary()?;
        while self.match_token(&TokenKind::Intersect) {
            let all = self.parse_set_quantifier();
            let right = self.parse_set_primary()?;
            left = SetExpr::SetOperation {
                op: SetOperator::Intersect,
                all,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_set_quantifier(&mut self) -> bool {
        if self.match_token(&TokenKind::All) {
            return true;
        }
        self.match_token(&TokenKind::Distinct);
        false
    }

    fn parse_set_primary(&mut self) -> Result<SetExpr, ParseError> {
        match &self.peek().kind {
            TokenKind::Select => Ok(SetExpr::Select(Box::new(self.parse_select()?))),
            TokenKind::LParen => {
                self.advance();
                let query = self.parse_query()?;
                self.expect(&TokenKind::RParen, "Expected ')' after subquery")?;
                Ok(SetExpr::Query(Box::new(query)))
            }
            TokenKind::Identifier(word) => Err(ParseError::not_a_query(
                format!("Only SELECT queries are allowed, found {}", word.to_uppercase()),
                self.current_span(),
            )),
            other => Err(ParseError::new(
                format!("Expected SELECT, found {other}"),
                self.current_span(),
            )
            .expected("SELECT")),
        }
    }

    fn parse_select(&mut self) -> Result<Select, ParseError> {
        self.expect(&TokenKind::Select, "Expected SELECT")?;
        let distinct = if self.match_token(&TokenKind::Distinct) {
            true
        } else {
            self.match_token(&TokenKind::All);
            false
        };

        let projection = self.parse_select_list()?;

        if self.check(&TokenKind::Into) {
            return Err(ParseError::not_a_query(
                "SELECT INTO is not allowed",
                self.current_span(),
            ));
        }

        let mut from = Vec::new();
        if self.match_token(&TokenKind::From) {
            loop {
                from.push(self.parse_table_with_joins()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let selection = if self.match_token(&TokenKind::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let group_by = if self.match_token(&TokenKind::Group) {
            self.expect(&TokenKind::By, "Expected BY after GROUP")?;
            self.parse_expr_list()?
        } else {
            Vec::new()
        };

        let having = if self.match_token(&TokenKind::Having) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(Select {
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
        })
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>, ParseError> {
        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem, ParseError> {
        if self.match_token(&TokenKind::Star) {
            return Ok(SelectItem::Wildcard);
        }
        if let Some(name) = self.try_qualified_wildcard()? {
            return Ok(SelectItem::QualifiedWildcard(name));
        }

        let expr = self.parse_expr()?;
        let alias = if self.match_token(&TokenKind::As) {
            Some(self.expect_identifier("Expected alias after AS")?)
        } else if self.is_identifier_at(0) && !self.at_non_alias_word() {
            Some(self.expect_identifier("Expected alias")?)
        } else {
            None
        };
        Ok(SelectItem::Expr { expr, alias })
    }

    fn try_qualified_wildcard(&mut self) -> Result<Option<ObjectName>, ParseError> {
        let mut offset = 0;
        loop {
            if !self.is_identifier_at(offset) || !self.check_nth(offset + 1, &TokenKind::Dot) {
                return Ok(None);
            }
            if self.check_nth(offset + 2, &TokenKind::Star) {
                break;
            }
            offset += 2;
        }
        let mut parts = Vec::new();
        loop {
            parts.push(self.expect_identifier("Expected qualifier")?);
            self.expect(&TokenKind::Dot, "Expected '.'")?;
            if self.match_token(&TokenKind::Star) {
                return Ok(Some(ObjectName(parts)));
            }
        }
    }

    fn at_non_alias_word(&self) -> bool {
        NON_ALIAS_WORDS.iter().any(|word| self.peek_word(word))
    }

    // ========== FROM Clause ==========

    fn parse_table_with_joins(&mut self) -> Result<TableWithJoins, ParseError> {
        let relation = self.parse_table_factor()?;
        let mut joins = Vec::new();
        loop {
            let kind = match self.peek().kind {
                TokenKind::Cross => {
                    self.advance();
                    self.expect(&TokenKind::Join, "Expected JOIN after CROSS")?;
                    let relation = self.parse_table_factor()?;
                    joins.push(Join {
                        operator: JoinOperator::Cross,
                        relation,
                    });
                    continue;
                }
                TokenKind::Join => {
                    self.advance();
                    TokenKind::Inner
                }
                TokenKind::Inner => {
                    self.advance();
                    self.expect(&TokenKind::Join, "Expected JOIN after INNER")?;
                    TokenKind::Inner
                }
                TokenKind::Left | TokenKind::Right | TokenKind::Full => {
                    let kind = self.advance().kind;
                    self.match_token(&TokenKind::Outer);
                    self.expect(&TokenKind::Join, "Expected JOIN")?;
                    kind
                }
                _ => break,
            };

            let relation = self.parse_table_factor()?;
            let constraint = if self.match_token(&TokenKind::On) {
                JoinConstraint::On(self.parse_expr()?)
            } else if self.match_token(&TokenKind::Using) {
                JoinConstraint::Using(self.parse_parenthesized_idents()?)
            } else {
                JoinConstraint::None
            };
            let operator = match kind {
                TokenKind::Left => JoinOperator::LeftOuter(constraint),
                TokenKind::Right => JoinOperator::RightOuter(constraint),
                TokenKind::Full => JoinOperator::FullOuter(constraint),
                _ => JoinOperator::Inner(constraint),
            };
            joins.push(Join { operator, relation });
        }
        Ok(TableWithJoins { relation, joins })
    }

    fn parse_table_factor(&mut self) -> Result<TableFactor, ParseError> {
        if self.match_token(&TokenKind::LParen) {
            if self.starts_query() {
                let subquery = self.parse_query()?;
                self.expect(&TokenKind::RParen, "Expected ')' after derived table")?;
                let alias = self.parse_optional_table_alias()?;
                return Ok(TableFactor::Derived {
                    subquery: Box::new(subquery),
                    alias,
                });
            }
            let inner = self.nested(|p| p.parse_table_with_joins())?;
            self.expect(&TokenKind::RParen, "Expected ')' after nested join")?;
            return Ok(TableFactor::NestedJoin(Box::new(inner)));
        }

        let name = self.parse_object_name()?;
        if self.check(&TokenKind::LParen) {
            return Err(ParseError::new(
                format!("Table functions are not supported: {}", name.dotted()),
                self.current_span(),
            ));
        }
        let alias = self.parse_optional_table_alias()?;
        Ok(TableFactor::Table { name, alias })
    }

    fn parse_optional_table_alias(&mut self) -> Result<Option<TableAlias>, ParseError> {
        let name = if self.match_token(&TokenKind::As) {
            self.expect_identifier("Expected alias after AS")?
        } else if self.is_identifier_at(0) && !self.at_non_alias_word() {
            self.expect_identifier("Expected alias")?
        } else {
            return Ok(None);
        };
        let columns = if self.check(&TokenKind::LParen) {
            self.parse_parenthesized_idents()?
        } else {
            Vec::new()
        };
        Ok(Some(TableAlias { name, columns }))
    }

    fn parse_object_name(&mut self) -> Result<ObjectName, ParseError> {
        let mut parts = vec![self.expect_identifier("Expected table name")?];
        while self.match_token(&TokenKind::Dot) {
            parts.push(self.expect_identifier("Expected name after '.'")?);
        }
        Ok(ObjectName(parts))
    }

    fn parse_parenthesized_idents(&mut self) -> Result<Vec<Ident>, ParseError> {
        self.expect(&TokenKind::LParen, "Expected '('")?;
        let mut idents = Vec::new();
        loop {
            idents.push(self.expect_identifier("Expected column name")?);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "Expected ')'")?;
        Ok(idents)
    }

    // ========== Expression Parsing ==========

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and_expr()?;
        while self.match_token(&TokenKind::Or) {
            self.count_operator()?;
            let right = self.parse_and_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not_expr()?;
        while self.match_token(&TokenKind::And) {
            self.count_operator()?;
            let right = self.parse_not_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.match_token(&TokenKind::Not) {
            let expr = self.nested(|p| p.parse_not_expr())?;
            Ok(Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: Box::new(expr),
            })
        } else {
            self.parse_comparison_expr()
        }
    }

    fn parse_comparison_expr(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_additive_expr()?;

        if self.match_token(&TokenKind::Is) {
            let negated = self.match_token(&TokenKind::Not);
            let target = match self.peek().kind {
                TokenKind::Null => IsTarget::Null,
                TokenKind::True => IsTarget::True,
                TokenKind::False => IsTarget::False,
                _ => {
                    return Err(ParseError::new(
                        format!("Expected NULL, TRUE or FALSE after IS, found {}", self.peek().kind),
                        self.current_span(),
                    ))
                }
            };
            self.advance();
            return Ok(Expr::Is {
                expr: Box::new(left),
                negated,
                target,
            });
        }

        let negated = self.check(&TokenKind::Not)
            && matches!(
                self.peek_nth(1).kind,
                TokenKind::In | TokenKind::Between | TokenKind::Like | TokenKind::Ilike
            );
        if negated {
            self.advance();
        }

        if self.match_token(&TokenKind::In) {
            self.expect(&TokenKind::LParen, "Expected '(' after IN")?;
            if self.starts_query() {
                let subquery = self.parse_query()?;
                self.expect(&TokenKind::RParen, "Expected ')' after IN subquery")?;
                return Ok(Expr::InSubquery {
                    expr: Box::new(left),
                    subquery: Box::new(subquery),
                    negated,
                });
            }
            let list = self.parse_expr_list()?;
            self.expect(&TokenKind::RParen, "Expected ')' after IN list")?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated,
            });
        }

        if self.match_token(&TokenKind::Between) {
            let low = self.parse_additive_expr()?;
            self.expect(&TokenKind::And, "Expected AND in BETWEEN")?;
            let high = self.parse_additive_expr()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                negated,
                low: Box::new(low),
                high: Box::new(high),
            });
        }

        if self.check(&TokenKind::Like) || self.check(&TokenKind::Ilike) {
            let case_insensitive = self.advance().kind == TokenKind::Ilike;
            let pattern = self.parse_additive_expr()?;
            return Ok(Expr::Like {
                expr: Box::new(left),
                negated,
                case_insensitive,
                pattern: Box::new(pattern),
            });
        }

        let op = match self.peek().kind {
            TokenKind::Eq => BinaryOperator::Eq,
            TokenKind::NotEq => BinaryOperator::NotEq,
            TokenKind::Lt => BinaryOperator::Lt,
            TokenKind::LtEq => BinaryOperator::LtEq,
            TokenKind::Gt => BinaryOperator::Gt,
            TokenKind::GtEq => BinaryOperator::GtEq,
            _ => return Ok(left),
        };
        self.advance();
        self.count_operator()?;
        let right = self.parse_additive_expr()?;
        Ok(Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    fn parse_additive_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative_expr()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOperator::Plus,
                TokenKind::Minus => BinaryOperator::Minus,
                TokenKind::Concat => BinaryOperator::Concat,
                _ => break,
            };
            self.advance();
            self.count_operator()?;
            let right = self.parse_multiplicative_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary_expr()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOperator::Multiply,
                TokenKind::Slash => BinaryOperator::Divide,
                TokenKind::Percent => BinaryOperator::Modulo,
                _ => break,
            };
            self.advance();
            self.count_operator()?;
            let right = self.parse_unary_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOperator::Minus,
            TokenKind::Plus => UnaryOperator::Plus,
            _ => {
                let expr = self.parse_primary_expr()?;
                return self.parse_postfix_expr(expr);
            }
        };
        self.advance();
        let expr = self.nested(|p| p.parse_unary_expr())?;
        Ok(Expr::UnaryOp {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Value(Value::Number(n)))
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Expr::Value(Value::String(s)))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Value(Value::Boolean(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Value(Value::Boolean(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Value(Value::Null))
            }
            TokenKind::LParen => {
                self.advance();
                if self.starts_query() {
                    let subquery = self.parse_query()?;
                    self.expect(&TokenKind::RParen, "Expected ')' after subquery")?;
                    return Ok(Expr::Subquery(Box::new(subquery)));
                }
                let expr = self.nested(|p| p.parse_expr())?;
                self.expect(&TokenKind::RParen, "Expected ')'")?;
                Ok(Expr::Nested(Box::new(expr)))
            }
            TokenKind::Exists => {
                self.advance();
                self.expect(&TokenKind::LParen, "Expected '(' after EXISTS")?;
                let subquery = self.parse_query()?;
                self.expect(&TokenKind::RParen, "Expected ')' after EXISTS subquery")?;
                Ok(Expr::Exists {
                    subquery: Box::new(subquery),
                    negated: false,
                })
            }
            TokenKind::Case => self.parse_case_expr(),
            TokenKind::Cast => {
                self.advance();
                self.expect(&TokenKind::LParen, "Expected '(' after CAST")?;
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::As, "Expected AS in CAST")?;
                let data_type = self.parse_data_type(true)?;
                self.expect(&TokenKind::RParen, "Expected ')' after CAST")?;
                Ok(Expr::Cast {
                    expr: Box::new(expr),
                    data_type,
                    shorthand: false,
                })
            }
            TokenKind::Interval => self.parse_interval_expr(),
            TokenKind::Left | TokenKind::Right if self.check_nth(1, &TokenKind::LParen) => {
                let name = self.advance().literal.to_lowercase();
                self.parse_function(ObjectName(vec![Ident::new(name)]))
            }
            TokenKind::Identifier(_) | TokenKind::QuotedIdentifier { .. } => {
                self.parse_identifier_or_function()
            }
            other => Err(ParseError::new(
                format!("Expected expression, found {other}"),
                self.current_span(),
            )
            .expected("expression")),
        }
    }

    fn parse_postfix_expr(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        while self.match_token(&TokenKind::DoubleColon) {
            self.count_operator()?;
            let data_type = self.parse_data_type(false)?;
            expr = Expr::Cast {
                expr: Box::new(expr),
                data_type,
                shorthand: true,
            };
        }
        Ok(expr)
    }

    fn parse_case_expr(&mut self) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::Case, "Expected CASE")?;
        let operand = if self.check(&TokenKind::When) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };

        let mut conditions = Vec::new();
        while self.match_token(&TokenKind::When) {
            let condition = self.parse_expr()?;
            self.expect(&TokenKind::Then, "Expected THEN")?;
            let result = self.parse_expr()?;
            conditions.push((condition, result));
        }
        if conditions.is_empty() {
            return Err(ParseError::new(
                "CASE requires at least one WHEN",
                self.current_span(),
            ));
        }

        let else_result = if self.match_token(&TokenKind::Else) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect(&TokenKind::End, "Expected END after CASE")?;

        Ok(Expr::Case {
            operand,
            conditions,
            else_result,
        })
    }

    fn parse_interval_expr(&mut self) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::Interval, "Expected INTERVAL")?;
        let value = match self.peek().kind.clone() {
            TokenKind::String(s) => Expr::Value(Value::String(s)),
            TokenKind::Number(n) => Expr::Value(Value::Number(n)),
            other => {
                return Err(ParseError::new(
                    format!("Expected interval value, found {other}"),
                    self.current_span(),
                ))
            }
        };
        self.advance();
        let unit = match &self.peek().kind {
            TokenKind::Identifier(word) if is_time_unit(word) => {
                let unit = word.to_uppercase();
                self.advance();
                Some(unit)
            }
            _ => None,
        };
        Ok(Expr::Interval {
            value: Box::new(value),
            unit,
        })
    }

    fn parse_identifier_or_function(&mut self) -> Result<Expr, ParseError> {
        let first = self.expect_identifier("Expected identifier")?;

        if first.quote.is_none() {
            let word = first.value.to_lowercase();
            if matches!(word.as_str(), "date" | "time" | "timestamp") {
                if let TokenKind::String(value) = self.peek().kind.clone() {
                    self.advance();
                    return Ok(Expr::TypedString {
                        data_type: word.to_uppercase(),
                        value,
                    });
                }
            }
            if word == "extract" && self.check(&TokenKind::LParen) {
                self.advance();
                let field = self.expect_identifier("Expected field in EXTRACT")?;
                self.expect(&TokenKind::From, "Expected FROM in EXTRACT")?;
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "Expected ')' after EXTRACT")?;
                return Ok(Expr::Extract {
                    field: field.value.to_uppercase(),
                    expr: Box::new(expr),
                });
            }
        }

        let mut parts = vec![first];
        while self.check(&TokenKind::Dot) && self.is_identifier_at(1) {
            self.advance();
            parts.push(self.expect_identifier("Expected name after '.'")?);
        }

        if self.check(&TokenKind::LParen) {
            return self.parse_function(ObjectName(parts));
        }
        if parts.len() == 1 {
            Ok(Expr::Identifier(parts.remove(0)))
        } else {
            Ok(Expr::CompoundIdentifier(parts))
        }
    }

    fn parse_function(&mut self, name: ObjectName) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::LParen, "Expected '(' after function name")?;
        let args = if self.match_token(&TokenKind::Star) {
            FunctionArgs::Star
        } else if self.check(&TokenKind::RParen) {
            FunctionArgs::List {
                distinct: false,
                args: Vec::new(),
            }
        } else {
            let distinct = self.parse_set_quantifier();
            FunctionArgs::List {
                distinct,
                args: self.parse_expr_list()?,
            }
        };
        self.expect(&TokenKind::RParen, "Expected ')' after function arguments")?;

        let over = if self.match_token(&TokenKind::Over) {
            Some(self.parse_window_spec()?)
        } else {
            None
        };

        Ok(Expr::Function(Function { name, args, over }))
    }

    fn parse_window_spec(&mut self) -> Result<WindowSpec, ParseError> {
        self.expect(&TokenKind::LParen, "Expected '(' after OVER")?;
        let partition_by = if self.match_token(&TokenKind::Partition) {
            self.expect(&TokenKind::By, "Expected BY after PARTITION")?;
            self.parse_expr_list()?
        } else {
            Vec::new()
        };
        let order_by = if self.match_token(&TokenKind::Order) {
            self.expect(&TokenKind::By, "Expected BY after ORDER")?;
            self.parse_order_by_list()?
        } else {
            Vec::new()
        };
        let frame = if self.peek_word("rows") || self.peek_word("range") || self.peek_word("groups")
        {
            let mut words = Vec::new();
            while !self.check(&TokenKind::RParen) {
                let token = self.advance();
                match token.kind {
                    TokenKind::Identifier(_)
                    | TokenKind::Number(_)
                    | TokenKind::Between
                    | TokenKind::And => words.push(token.literal.to_uppercase()),
                    other => {
                        return Err(ParseError::new(
                            format!("Unexpected {other} in window frame"),
                            token.span,
                        ))
                    }
                }
            }
            Some(words.join(" "))
        } else {
            None
        };
        self.expect(&TokenKind::RParen, "Expected ')' after window specification")?;
        Ok(WindowSpec {
            partition_by,
            order_by,
            frame,
        })
    }

    /// Type names are kept as text; only bare words and numeric parameters
    /// are accepted so the text cannot smuggle other syntax.
    fn parse_data_type(&mut self, multiword: bool) -> Result<String, ParseError> {
        let mut words: Vec<String> = Vec::new();
        loop {
            match &self.peek().kind {
                TokenKind::Identifier(word) => words.push(word.to_uppercase()),
                TokenKind::With if multiword && !words.is_empty() => words.push("WITH".to_string()),
                _ => break,
            }
            self.advance();
            if !multiword {
                break;
            }
        }
        if words.is_empty() {
            return Err(ParseError::new(
                format!("Expected data type, found {}", self.peek().kind),
                self.current_span(),
            )
            .expected("data type"));
        }
        let mut data_type = words.join(" ");

        if self.match_token(&TokenKind::LParen) {
            let mut params = Vec::new();
            loop {
                match self.advance() {
                    Token {
                        kind: TokenKind::Number(n),
                        ..
                    } => params.push(n),
                    token => {
                        return Err(ParseError::new(
                            format!("Expected numeric type parameter, found {}", token.kind),
                            token.span,
                        ))
                    }
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "Expected ')' after type parameters")?;
            data_type.push('(');
            data_type.push_str(&params.join(", "));
            data_type.push(')');
        }
        Ok(data_type)
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = Vec::new();
        loop {
            exprs.push(self.parse_expr()?);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        Ok(exprs)
    }

    fn parse_order_by_list(&mut self) -> Result<Vec<OrderByExpr>, ParseError> {
        let mut items = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let asc = if self.match_token(&TokenKind::Asc) {
                Some(true)
            } else if self.match_token(&TokenKind::Desc) {
                Some(false)
            } else {
                None
            };
            let nulls_first = if self.peek_word("nulls") {
                self.advance();
                if self.peek_word("first") {
                    self.advance();
                    Some(true)
                } else if self.peek_word("last") {
                    self.advance();
                    Some(false)
                } else {
                    return Err(ParseError::new(
                        "Expected FIRST or LAST after NULLS",
                        self.current_span(),
                    ));
                }
            } else {
                None
            };
            items.push(OrderByExpr {
                expr,
                asc,
                nulls_first,
            });
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }
}

fn is_time_unit(word: &str) -> bool {
    let lower = word.to_lowercase();
    let singular = lower.strip_suffix('s').unwrap_or(&lower);
    TIME_UNITS.contains(&singular)
}
