//! Token types for the read-only SQL subset the guard accepts.

use std::fmt;

/// Source location for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self {
            start: 0,
            end: 0,
            line: 1,
            column: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub literal: String,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span, literal: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            literal: literal.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    // Literals
    Number(String),
    String(String),

    // Identifiers
    Identifier(String),
    QuotedIdentifier { value: String, quote: char },

    // Keywords. Words outside this list (NULLS, FIRST, ROWS, DATE, ...) lex
    // as identifiers and are recognised by position.
    Select,
    From,
    Where,
    Group,
    By,
    Having,
    Order,
    Limit,
    Offset,
    As,
    Distinct,
    All,
    Union,
    Intersect,
    Except,
    With,
    Recursive,
    Join,
    Inner,
    Left,
    Right,
    Full,
    Outer,
    Cross,
    On,
    Using,
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
    In,
    Between,
    Like,
    Ilike,
    Exists,
    Case,
    When,
    Then,
    Else,
    End,
    Cast,
    Interval,
    Asc,
    Desc,
    Into,
    Over,
    Partition,

    // Punctuation and operators
    Comma,
    Dot,
    LParen,
    RParen,
    Semicolon,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Concat,
    DoubleColon,

    Eof,
}

impl TokenKind {
    pub fn from_keyword(word: &str) -> Option<TokenKind> {
        let kind = match word.to_ascii_uppercase().as_str() {
            "SELECT" => TokenKind::Select,
            "FROM" => TokenKind::From,
            "WHERE" => TokenKind::Where,
            "GROUP" => TokenKind::Group,
            "BY" => TokenKind::By,
            "HAVING" => TokenKind::Having,
            "ORDER" => TokenKind::Order,
            "LIMIT" => TokenKind::Limit,
            "OFFSET" => TokenKind::Offset,
            "AS" => TokenKind::As,
            "DISTINCT" => TokenKind::Distinct,
            "ALL" => TokenKind::All,
            "UNION" => TokenKind::Union,
            "INTERSECT" => TokenKind::Intersect,
            "EXCEPT" => TokenKind::Except,
            "WITH" => TokenKind::With,
            "RECURSIVE" => TokenKind::Recursive,
            "JOIN" => TokenKind::Join,
            "INNER" => TokenKind::Inner,
            "LEFT" => TokenKind::Left,
            "RIGHT" => TokenKind::Right,
            "FULL" => TokenKind::Full,
            "OUTER" => TokenKind::Outer,
            "CROSS" => TokenKind::Cross,
            "ON" => TokenKind::On,
            "USING" => TokenKind::Using,
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "NOT" => TokenKind::Not,
            "IS" => TokenKind::Is,
            "NULL" => TokenKind::Null,
            "TRUE" => TokenKind::True,
            "FALSE" => TokenKind::False,
            "IN" => TokenKind::In,
            "BETWEEN" => TokenKind::Between,
            "LIKE" => TokenKind::Like,
            "ILIKE" => TokenKind::Ilike,
            "EXISTS" => TokenKind::Exists,
            "CASE" => TokenKind::Case,
            "WHEN" => TokenKind::When,
            "THEN" => TokenKind::Then,
            "ELSE" => TokenKind::Else,
            "END" => TokenKind::End,
            "CAST" => TokenKind::Cast,
            "INTERVAL" => TokenKind::Interval,
            "ASC" => TokenKind::Asc,
            "DESC" => TokenKind::Desc,
            "INTO" => TokenKind::Into,
            "OVER" => TokenKind::Over,
            "PARTITION" => TokenKind::Partition,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_keyword(word: &str) -> bool {
        Self::from_keyword(word).is_some()
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "{n}"),
            TokenKind::String(s) => write!(f, "'{s}'"),
            TokenKind::Identifier(name) => write!(f, "{name}"),
            TokenKind::QuotedIdentifier { value, quote } => write!(f, "{quote}{value}{quote}"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Dot => write!(f, "."),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Eq => write!(f, "="),
            TokenKind::NotEq => write!(f, "<>"),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::LtEq => write!(f, "<="),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::GtEq => write!(f, ">="),
            TokenKind::Concat => write!(f, "||"),
            TokenKind::DoubleColon => write!(f, "::"),
            TokenKind::Eof => write!(f, "end of input"),
            keyword => write!(f, "{}", format!("{keyword:?}").to_ascii_uppercase()),
        }
    }
}
