//! Converts candidate SQL text into tokens.
//!
//! String literals follow standard SQL quoting (`''` escapes a quote,
//! backslash is an ordinary character). Comments are dropped, so a rewritten
//! statement never carries them forward.

use std::iter::Peekable;
use std::str::Chars;

use crate::token::{Span, Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl LexError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lexer error at line {}, column {}: {}",
            self.span.line, self.span.column, self.message
        )
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<Chars<'a>>,
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    errors: Vec<LexError>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().peekable(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Tokenize the whole input. The returned vector always ends with `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, Vec<LexError>> {
        while !self.is_at_end() {
            self.scan_token();
        }
        self.tokens.push(Token::new(
            TokenKind::Eof,
            Span::new(self.pos, self.pos, self.line, self.column),
            "",
        ));
        if self.errors.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.errors)
        }
    }

    fn is_at_end(&mut self) -> bool {
        self.chars.peek().is_none()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.chars.clone();
        chars.next();
        chars.next()
    }

    fn make_span(&self, start: usize, start_line: usize, start_col: usize) -> Span {
        Span::new(start, self.pos, start_line, start_col)
    }

    fn add_token(&mut self, kind: TokenKind, start: usize, start_line: usize, start_col: usize) {
        let span = self.make_span(start, start_line, start_col);
        let literal = &self.input[start..self.pos];
        self.tokens.push(Token::new(kind, span, literal));
    }

    fn add_error(
        &mut self,
        message: impl Into<String>,
        start: usize,
        start_line: usize,
        start_col: usize,
    ) {
        let span = self.make_span(start, start_line, start_col);
        self.errors.push(LexError::new(message, span));
    }

    fn previous_ends_operand(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.kind),
            Some(TokenKind::Identifier(_))
                | Some(TokenKind::QuotedIdentifier { .. })
                | Some(TokenKind::RParen)
        )
    }

    fn scan_token(&mut self) {
        let start = self.pos;
        let start_line = self.line;
        let start_col = self.column;

        let Some(c) = self.advance() else {
            return;
        };

        match c {
            c if c.is_whitespace() => {}

            '(' => self.add_token(TokenKind::LParen, start, start_line, start_col),
            ')' => self.add_token(TokenKind::RParen, start, start_line, start_col),
            ',' => self.add_token(TokenKind::Comma, start, start_line, start_col),
            ';' => self.add_token(TokenKind::Semicolon, start, start_line, start_col),
            '+' => self.add_token(TokenKind::Plus, start, start_line, start_col),
            '*' => self.add_token(TokenKind::Star, start, start_line, start_col),
            '%' => self.add_token(TokenKind::Percent, start, start_line, start_col),
            '=' => self.add_token(TokenKind::Eq, start, start_line, start_col),

            '/' => {
                if self.peek() == Some('*') {
                    self.advance();
                    self.scan_block_comment(start, start_line, start_col);
                } else {
                    self.add_token(TokenKind::Slash, start, start_line, start_col);
                }
            }

            '-' => {
                if self.peek() == Some('-') {
                    self.skip_line_comment();
                } else {
                    self.add_token(TokenKind::Minus, start, start_line, start_col);
                }
            }

            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    self.add_token(TokenKind::NotEq, start, start_line, start_col);
                } else {
                    self.add_error("Unexpected character '!'", start, start_line, start_col);
                }
            }

            '<' => match self.peek() {
                Some('=') => {
                    self.advance();
                    self.add_token(TokenKind::LtEq, start, start_line, start_col);
                }
                Some('>') => {
                    self.advance();
                    self.add_token(TokenKind::NotEq, start, start_line, start_col);
                }
                _ => self.add_token(TokenKind::Lt, start, start_line, start_col),
            },

            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    self.add_token(TokenKind::GtEq, start, start_line, start_col);
                } else {
                    self.add_token(TokenKind::Gt, start, start_line, start_col);
                }
            }

            '|' => {
                if self.peek() == Some('|') {
                    self.advance();
                    self.add_token(TokenKind::Concat, start, start_line, start_col);
                } else {
                    self.add_error("Unexpected character '|'", start, start_line, start_col);
                }
            }

            ':' => {
                if self.peek() == Some(':') {
                    self.advance();
                    self.add_token(TokenKind::DoubleColon, start, start_line, start_col);
                } else {
                    self.add_error("Unexpected character ':'", start, start_line, start_col);
                }
            }

            '.' => {
                let digit_follows = self.peek().is_some_and(|c| c.is_ascii_digit());
                if digit_follows && !self.previous_ends_operand() {
                    self.scan_number(start, start_line, start_col);
                } else {
                    self.add_token(TokenKind::Dot, start, start_line, start_col);
                }
            }

            '\'' => self.scan_string(start, start_line, start_col),
            '"' => self.scan_quoted_identifier(start, start_line, start_col, '"'),
            '`' => self.scan_quoted_identifier(start, start_line, start_col, '`'),

            '0'..='9' => self.scan_number(start, start_line, start_col),

            c if c.is_alphabetic() || c == '_' => {
                self.scan_identifier(start, start_line, start_col)
            }

            _ => self.add_error(
                format!("Unexpected character '{c}'"),
                start,
                start_line,
                start_col,
            ),
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn scan_block_comment(&mut self, start: usize, start_line: usize, start_col: usize) {
        while let Some(c) = self.advance() {
            if c == '*' && self.peek() == Some('/') {
                self.advance();
                return;
            }
        }
        self.add_error("Unterminated block comment", start, start_line, start_col);
    }

    fn scan_string(&mut self, start: usize, start_line: usize, start_col: usize) {
        let mut value = String::new();
        while let Some(c) = self.advance() {
            if c == '\'' {
                if self.peek() == Some('\'') {
                    self.advance();
                    value.push('\'');
                    continue;
                }
                self.add_token(TokenKind::String(value), start, start_line, start_col);
                return;
            }
            value.push(c);
        }
        self.add_error("Unterminated string literal", start, start_line, start_col);
    }

    fn scan_quoted_identifier(
        &mut self,
        start: usize,
        start_line: usize,
        start_col: usize,
        quote: char,
    ) {
        let mut value = String::new();
        while let Some(c) = self.advance() {
            if c == quote {
                if self.peek() == Some(quote) {
                    self.advance();
                    value.push(quote);
                    continue;
                }
                if value.is_empty() {
                    self.add_error("Empty quoted identifier", start, start_line, start_col);
                } else {
                    self.add_token(
                        TokenKind::QuotedIdentifier { value, quote },
                        start,
                        start_line,
                        start_col,
                    );
                }
                return;
            }
            value.push(c);
        }
        self.add_error("Unterminated quoted identifier", start, start_line, start_col);
    }

    fn scan_number(&mut self, start: usize, start_line: usize, start_col: usize) {
        let mut seen_dot = self.input[start..self.pos].contains('.');
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.' && !seen_dot && self.peek_next().is_some_and(|n| n.is_ascii_digit())
            {
                seen_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let next = self.peek_next();
            let signed = matches!(next, Some('+') | Some('-'));
            if next.is_some_and(|n| n.is_ascii_digit()) || signed {
                self.advance();
                if signed {
                    self.advance();
                }
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            // `1abc` is neither a number nor an identifier
            while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                self.advance();
            }
            self.add_error("Malformed numeric literal", start, start_line, start_col);
            return;
        }
        let text = self.input[start..self.pos].to_string();
        self.add_token(TokenKind::Number(text), start, start_line, start_col);
    }

    fn scan_identifier(&mut self, start: usize, start_line: usize, start_col: usize) {
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.advance();
        }
        let word = &self.input[start..self.pos];
        let kind = TokenKind::from_keyword(word)
            .unwrap_or_else(|| TokenKind::Identifier(word.to_string()));
        self.add_token(kind, start, start_line, start_col);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        Lexer::new(sql)
            .tokenize()
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn semicolon_inside_string_is_not_a_token() {
        let tokens = kinds("SELECT 'a;b' FROM projects");
        assert!(!tokens.contains(&TokenKind::Semicolon));
        assert!(tokens.contains(&TokenKind::String("a;b".to_string())));
    }

    #[test]
    fn comments_are_dropped() {
        let tokens = kinds("SELECT 1 -- ; DROP TABLE x\n/* ; */ FROM projects");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Select,
                TokenKind::Number("1".to_string()),
                TokenKind::From,
                TokenKind::Identifier("projects".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn doubled_quotes_unescape() {
        let tokens = kinds("SELECT 'it''s'");
        assert_eq!(tokens[1], TokenKind::String("it's".to_string()));
    }

    #[test]
    fn backslash_is_literal_in_strings() {
        let tokens = kinds(r"SELECT 'a\' FROM t");
        assert_eq!(tokens[1], TokenKind::String("a\\".to_string()));
        assert_eq!(tokens[2], TokenKind::From);
    }

    #[test]
    fn quoted_identifiers_keep_quote_style() {
        let tokens = kinds("SELECT \"Total \"\"Spend\"\"\", `x` FROM t");
        assert_eq!(
            tokens[1],
            TokenKind::QuotedIdentifier {
                value: "Total \"Spend\"".to_string(),
                quote: '"'
            }
        );
        assert_eq!(
            tokens[3],
            TokenKind::QuotedIdentifier {
                value: "x".to_string(),
                quote: '`'
            }
        );
    }

    #[test]
    fn numbers_and_qualified_names() {
        let tokens = kinds("SELECT p.id, 1.5, .25, 2e10 FROM p");
        assert_eq!(tokens[1], TokenKind::Identifier("p".to_string()));
        assert_eq!(tokens[2], TokenKind::Dot);
        assert_eq!(tokens[5], TokenKind::Number("1.5".to_string()));
        assert_eq!(tokens[7], TokenKind::Number(".25".to_string()));
        assert_eq!(tokens[9], TokenKind::Number("2e10".to_string()));
    }

    #[test]
    fn unterminated_constructs_are_errors() {
        assert!(Lexer::new("SELECT 'abc").tokenize().is_err());
        assert!(Lexer::new("SELECT 1 /* open").tokenize().is_err());
        assert!(Lexer::new("SELECT \"abc").tokenize().is_err());
    }

    #[test]
    fn unsupported_characters_are_errors() {
        let errors = Lexer::new("SELECT $1").tokenize().expect_err("dollar");
        assert!(errors[0].message.contains('$'));
    }
}
