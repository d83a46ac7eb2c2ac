use crate::token::{Token, TokenType};
use phf::phf_map;
use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("[line {line}] Error: {message}")]
pub struct ScanError {
    pub line: i32,
    pub message: String,
}

// Note: current becomes self.iter.peek()?.0
struct Scanner<'a> {
    source: &'a str,
    iter: Peekable<CharIndices<'a>>,
    start: usize,
    line: i32,
}

/// Splits `source` into tokens. The token list always ends with `EOF`, even
/// when errors were found; scanning carries on past bad characters.
pub fn scan_tokens(source: &str) -> (Vec<Token>, Vec<ScanError>) {
    let mut scanner = Scanner {
        source,
        iter: source.char_indices().peekable(),
        start: 0,
        line: 1,
    };
    let mut tokens: Vec<Token> = Vec::new();
    let mut errors: Vec<ScanError> = Vec::new();

    while let Some((idx, _)) = scanner.iter.peek() {
        scanner.start = *idx;
        match scanner.scan_token() {
            Ok(Some(token)) => tokens.push(token),
            Ok(None) => (),
            Err(e) => errors.push(e),
        }
    }
    tokens.push(Token::new(TokenType::EOF, "", scanner.line));
    debug!(tokens = tokens.len(), errors = errors.len(), "scanned source");
    (tokens, errors)
}

impl<'a> Scanner<'a> {
    fn scan_token(&mut self) -> Result<Option<Token>, ScanError> {
        let c = match self.iter.next() {
            Some((_, c)) => c,
            None => return Ok(None),
        };
        match c {
            '(' => Ok(Some(self.token(TokenType::LeftParen))),
            ')' => Ok(Some(self.token(TokenType::RightParen))),
            '{' => Ok(Some(self.token(TokenType::LeftBrace))),
            '}' => Ok(Some(self.token(TokenType::RightBrace))),
            ',' => Ok(Some(self.token(TokenType::Comma))),
            '.' => Ok(Some(self.token(TokenType::Dot))),
            '-' => Ok(Some(self.token(TokenType::Minus))),
            '+' => Ok(Some(self.token(TokenType::Plus))),
            ';' => Ok(Some(self.token(TokenType::Semicolon))),
            '*' => Ok(Some(self.token(TokenType::Star))),
            '!' => Ok(Some(self.either('=', TokenType::BangEqual, TokenType::Bang))),
            '=' => Ok(Some(self.either('=', TokenType::EqualEqual, TokenType::Equal))),
            '<' => Ok(Some(self.either('=', TokenType::LessEqual, TokenType::Less))),
            '>' => Ok(Some(self.either('=', TokenType::GreaterEqual, TokenType::Greater))),
            '/' => {
                if self.next_if('/') {
                    while let Some((_, c)) = self.iter.peek() {
                        if *c == '\n' {
                            break;
                        }
                        self.iter.next();
                    }
                    Ok(None)
                } else {
                    Ok(Some(self.token(TokenType::Slash)))
                }
            }
            ' ' | '\r' | '\t' => Ok(None),
            '\n' => {
                self.line += 1;
                Ok(None)
            }
            '"' => self.string().map(Some),
            '0'..='9' => self.number().map(Some),
            'a'..='z' | 'A'..='Z' | '_' => Ok(Some(self.identifier())),
            _ => Err(self.error("Unexpected character.")),
        }
    }
    fn current(&mut self) -> usize {
        match self.iter.peek() {
            None => self.source.len(),
            Some((idx, _)) => *idx,
        }
    }
    fn token(&mut self, token_type: TokenType) -> Token {
        let current = self.current();
        Token {
            tokentype: token_type,
            lexeme: self.source[self.start..current].to_string(),
            line: self.line,
        }
    }
    fn either(&mut self, expected: char, matched: TokenType, single: TokenType) -> Token {
        if self.next_if(expected) {
            self.token(matched)
        } else {
            self.token(single)
        }
    }
    fn next_if(&mut self, expected: char) -> bool {
        if let Some((_, c)) = self.iter.peek() {
            if *c == expected {
                self.iter.next();
                return true;
            }
        }
        false
    }
    fn error(&self, message: &str) -> ScanError {
        ScanError {
            line: self.line,
            message: message.to_string(),
        }
    }
    fn string(&mut self) -> Result<Token, ScanError> {
        loop {
            match self.iter.next() {
                None => return Err(self.error("Unterminated string.")),
                Some((_, '"')) => break,
                Some((_, '\n')) => self.line += 1,
                Some(_) => (),
            }
        }
        let current = self.current();
        let text = self.source[self.start + 1..current - 1].to_string();
        Ok(self.token(TokenType::String(text)))
    }
    fn digits(&mut self) {
        while let Some((_, c)) = self.iter.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            self.iter.next();
        }
    }
    fn number(&mut self) -> Result<Token, ScanError> {
        self.digits();

        // A '.' only belongs to the number when a digit follows it.
        if let Some((_, '.')) = self.iter.peek() {
            let mut lookahead = self.iter.clone();
            lookahead.next();
            if let Some((_, c)) = lookahead.peek() {
                if c.is_ascii_digit() {
                    self.iter.next();
                    self.digits();
                }
            }
        }

        let current = self.current();
        let value: f64 = self.source[self.start..current]
            .parse()
            .map_err(|_| self.error("Invalid number."))?;
        Ok(self.token(TokenType::Number(value)))
    }
    fn identifier(&mut self) -> Token {
        while let Some((_, c)) = self.iter.peek() {
            match c {
                '0'..='9' | 'a'..='z' | 'A'..='Z' | '_' => {
                    self.iter.next();
                }
                _ => break,
            }
        }
        let current = self.current();
        let text = &self.source[self.start..current];
        match KEYWORDS.get(text) {
            None => self.token(TokenType::Identifier(text.to_string())),
            Some(x) => self.token(x.clone()),
        }
    }
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf_map! {
    "and" => TokenType::And,
    "class" => TokenType::Class,
    "else" => TokenType::Else,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "nil" => TokenType::Nil,
    "or" => TokenType::Or,
    "print" => TokenType::Print,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "var" => TokenType::Var,
    "while" => TokenType::While,
};
