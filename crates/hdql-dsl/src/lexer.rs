//! Hand-written lexer for HDQL.
//!
//! Produces a flat token stream with positions; the parser never looks at raw
//! characters. Keywords `AND`/`OR`/`NOT` are case-insensitive, the remaining
//! reserved words are lowercase only.

use crate::error::{ParseError, Position};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(f64),

    /// `->`
    Arrow,
    /// `-[name]->`
    NamedArrow(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Star,
    Tilde,
    Question,
    Assign,
    Plus,
    Minus,

    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,

    And,
    Or,
    Not,
    SimilarTo,
    IsTo,
    As,
    Maximize,
    Minimize,
    SubjectTo,
    True,
    False,

    Eof,
}

impl Token {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Token::Lt | Token::Le | Token::Gt | Token::Ge | Token::EqEq | Token::Ne
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier `{name}`"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Number(n) => write!(f, "number `{n}`"),
            Token::Arrow => f.write_str("`->`"),
            Token::NamedArrow(name) => write!(f, "`-[{name}]->`"),
            Token::Dot => f.write_str("`.`"),
            Token::Comma => f.write_str("`,`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Star => f.write_str("`*`"),
            Token::Tilde => f.write_str("`~`"),
            Token::Question => f.write_str("`?`"),
            Token::Assign => f.write_str("`=`"),
            Token::Plus => f.write_str("`+`"),
            Token::Minus => f.write_str("`-`"),
            Token::Lt => f.write_str("`<`"),
            Token::Le => f.write_str("`<=`"),
            Token::Gt => f.write_str("`>`"),
            Token::Ge => f.write_str("`>=`"),
            Token::EqEq => f.write_str("`==`"),
            Token::Ne => f.write_str("`!=`"),
            Token::And => f.write_str("`AND`"),
            Token::Or => f.write_str("`OR`"),
            Token::Not => f.write_str("`NOT`"),
            Token::SimilarTo => f.write_str("`similar_to`"),
            Token::IsTo => f.write_str("`is_to`"),
            Token::As => f.write_str("`as`"),
            Token::Maximize => f.write_str("`maximize`"),
            Token::Minimize => f.write_str("`minimize`"),
            Token::SubjectTo => f.write_str("`subject_to`"),
            Token::True => f.write_str("`true`"),
            Token::False => f.write_str("`false`"),
            Token::Eof => f.write_str("end of query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: Position,
}

/// Reserved words, in the form the lexer recognises them.
pub const KEYWORDS: &[&str] = &[
    "and",
    "or",
    "not",
    "similar_to",
    "is_to",
    "as",
    "maximize",
    "minimize",
    "subject_to",
    "true",
    "false",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word.to_ascii_lowercase().as_str())
}

fn keyword(word: &str) -> Option<Token> {
    match word.to_ascii_uppercase().as_str() {
        "AND" => return Some(Token::And),
        "OR" => return Some(Token::Or),
        "NOT" => return Some(Token::Not),
        _ => {}
    }
    match word {
        "similar_to" => Some(Token::SimilarTo),
        "is_to" => Some(Token::IsTo),
        "as" => Some(Token::As),
        "maximize" => Some(Token::Maximize),
        "minimize" => Some(Token::Minimize),
        "subject_to" => Some(Token::SubjectTo),
        "true" => Some(Token::True),
        "false" => Some(Token::False),
        _ => None,
    }
}

pub struct Lexer {
    input: Vec<char>,
    offset: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the whole input. The returned stream always ends in `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ParseError> {
        let mut out: Vec<Spanned> = Vec::new();
        loop {
            let argument = matches!(
                out.as_slice(),
                [.., Spanned { token: Token::Ident(_), .. }, Spanned { token: Token::LParen, .. }]
            );
            let spanned = self.next_token(argument)?;
            let done = spanned.token == Token::Eof;
            out.push(spanned);
            if done {
                return Ok(out);
            }
        }
    }

    fn position(&self) -> Position {
        Position {
            offset: self.offset,
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.offset).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.input.get(self.offset + ahead).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    /// `argument` is set right after `ident(`, where the next word may be a
    /// hyphenated name or a glob.
    fn next_token(&mut self, argument: bool) -> Result<Spanned, ParseError> {
        self.skip_whitespace();
        let position = self.position();
        let Some(c) = self.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                position,
            });
        };

        let token = match c {
            '"' | '\'' => self.read_string(position)?,
            c if argument && (c.is_alphabetic() || matches!(c, '_' | '*' | '?')) => {
                self.read_argument()
            }
            c if c.is_ascii_digit() => self.read_number(position)?,
            c if c.is_alphabetic() || c == '_' => {
                let word = self.read_identifier();
                keyword(&word).unwrap_or(Token::Ident(word))
            }
            '-' => self.read_minus(position)?,
            _ => {
                self.advance();
                match c {
                    '.' => Token::Dot,
                    ',' => Token::Comma,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '*' => Token::Star,
                    '~' => Token::Tilde,
                    '?' => Token::Question,
                    '+' => Token::Plus,
                    '<' => self.with_eq(Token::Lt, Token::Le),
                    '>' => self.with_eq(Token::Gt, Token::Ge),
                    '=' => self.with_eq(Token::Assign, Token::EqEq),
                    '!' if self.peek() == Some('=') => {
                        self.advance();
                        Token::Ne
                    }
                    other => {
                        return Err(ParseError::UnexpectedCharacter {
                            ch: other,
                            position,
                        })
                    }
                }
            }
        };

        Ok(Spanned { token, position })
    }

    fn with_eq(&mut self, bare: Token, with_eq: Token) -> Token {
        if self.peek() == Some('=') {
            self.advance();
            with_eq
        } else {
            bare
        }
    }

    fn read_minus(&mut self, position: Position) -> Result<Token, ParseError> {
        self.advance();
        match self.peek() {
            Some('>') => {
                self.advance();
                Ok(Token::Arrow)
            }
            Some('[') => {
                self.advance();
                self.skip_whitespace();
                if !matches!(self.peek(), Some(c) if c.is_alphabetic() || c == '_') {
                    return Err(self.unexpected_char_or_end(position));
                }
                let name = self.read_joined(false);
                self.skip_whitespace();
                for expected in [']', '-', '>'] {
                    if self.peek() != Some(expected) {
                        return Err(self.unexpected_char_or_end(position));
                    }
                    self.advance();
                }
                Ok(Token::NamedArrow(name))
            }
            _ => Ok(Token::Minus),
        }
    }

    fn unexpected_char_or_end(&self, start: Position) -> ParseError {
        match self.peek() {
            Some(ch) => ParseError::UnexpectedCharacter {
                ch,
                position: self.position(),
            },
            None => ParseError::UnexpectedEnd {
                expected: vec!["`]->`".to_string()],
                position: start,
            },
        }
    }

    /// Plain identifiers are word characters only, so `coverage-effort` is
    /// `coverage`, `-`, `effort`.
    fn read_identifier(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            word.push(c);
            self.advance();
        }
        word
    }

    /// Relation names and lookup arguments may contain `-` when it joins two
    /// word characters (`python-dev`, but not `a->b`). With `glob` the word
    /// also keeps `*` and `?`.
    fn read_joined(&mut self, glob: bool) -> String {
        let part = |c: char| c.is_alphanumeric() || c == '_' || (glob && matches!(c, '*' | '?'));
        let mut word = String::new();
        while let Some(c) = self.peek() {
            let joins = c == '-' && matches!(self.peek_at(1), Some(n) if part(n));
            if !(part(c) || joins) {
                break;
            }
            word.push(c);
            self.advance();
        }
        word
    }

    /// The word inside `ident(...)`. A lone `*` or `?` keeps its own token.
    fn read_argument(&mut self) -> Token {
        let word = self.read_joined(true);
        match word.as_str() {
            "*" => Token::Star,
            "?" => Token::Question,
            _ if word.contains(['*', '?']) => Token::Ident(word),
            _ => keyword(&word).unwrap_or(Token::Ident(word)),
        }
    }

    fn read_string(&mut self, position: Position) -> Result<Token, ParseError> {
        let Some(quote) = self.advance() else {
            return Err(ParseError::UnterminatedString { position });
        };
        let mut value = String::new();
        loop {
            match self.advance() {
                None => return Err(ParseError::UnterminatedString { position }),
                Some(c) if c == quote => return Ok(Token::Str(value)),
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(escaped) => value.push(escaped),
                    None => return Err(ParseError::UnterminatedString { position }),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn read_number(&mut self, position: Position) -> Result<Token, ParseError> {
        let mut text = String::new();
        self.take_digits(&mut text);

        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            self.take_digits(&mut text);
        }

        if matches!(self.peek(), Some('e' | 'E')) {
            let signed = matches!(self.peek_at(1), Some('+' | '-'));
            let digit_at = if signed { 2 } else { 1 };
            if matches!(self.peek_at(digit_at), Some(c) if c.is_ascii_digit()) {
                for _ in 0..digit_at {
                    if let Some(c) = self.advance() {
                        text.push(c);
                    }
                }
                self.take_digits(&mut text);
            }
        }

        if matches!(self.peek(), Some(c) if c.is_alphabetic() || c == '_') {
            while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
                if let Some(c) = self.advance() {
                    text.push(c);
                }
            }
            return Err(ParseError::InvalidNumber { text, position });
        }

        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| ParseError::InvalidNumber { text, position })
    }

    fn take_digits(&mut self, out: &mut String) {
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            out.push(c);
            self.advance();
        }
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    Lexer::new(input).tokenize()
}
