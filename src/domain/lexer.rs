//! Script tokenizer.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` tokens so the parser never has to look at whitespace. Lines
//! inside brackets and lines ending in a backslash are joined.

use crate::domain::error::ParseError;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

// Longest first so that greedy matching picks `**=` over `**` over `*`.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "->", ":=", "<<", ">>", "+", "-", "*", "/", "%", "<", ">",
    "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    EndOfInput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Name(n) => format!("'{n}'"),
            TokenKind::Int(i) => format!("'{i}'"),
            TokenKind::Float(f) => format!("'{f}'"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Op(op) => format!("'{op}'"),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            TokenKind::EndOfInput => "end of input".to_string(),
        }
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    paren_depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            paren_depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.line, self.column)
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    fn last_is_line_break(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline) | Some(TokenKind::Indent) | Some(TokenKind::Dedent)
        )
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.paren_depth == 0 {
                at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }
            let Some(ch) = self.peek() else { break };
            match ch {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.advance();
                }
                '#' => self.skip_comment(),
                '\n' => {
                    let (line, column) = (self.line, self.column);
                    self.advance();
                    if self.paren_depth == 0 {
                        if !self.last_is_line_break() {
                            self.push(TokenKind::Newline, line, column);
                        }
                        at_line_start = true;
                    }
                }
                '\\' => {
                    self.advance();
                    match self.peek() {
                        Some('\n') => {
                            self.advance();
                        }
                        Some('\r') if self.peek_at(1) == Some('\n') => {
                            self.advance();
                            self.advance();
                        }
                        _ => return Err(self.error("unexpected character after line continuation")),
                    }
                }
                '"' | '\'' => self.lex_string(false)?,
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number()?,
                c if c.is_ascii_alphabetic() || c == '_' => self.lex_name()?,
                _ => self.lex_operator()?,
            }
        }

        let (line, column) = (self.line, self.column);
        if !self.last_is_line_break() {
            self.push(TokenKind::Newline, line, column);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, line, column);
        }
        self.push(TokenKind::EndOfInput, line, column);
        Ok(self.tokens)
    }

    /// Measures leading whitespace of a logical line. Returns true when the
    /// line is blank or comment-only and was consumed entirely.
    fn handle_indentation(&mut self) -> Result<bool, ParseError> {
        let mut width = 0usize;
        while let Some(ch) = self.peek() {
            match ch {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.advance();
        }

        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.advance();
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.advance();
                }
                return Ok(true);
            }
            _ => {}
        }

        let (line, column) = (self.line, self.column);
        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, line, column);
        } else if width < current {
            while self.indents.last().is_some_and(|&w| w > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, line, column);
            }
            if self.indents.last() != Some(&width) {
                return Err(ParseError::new(
                    "unindent does not match any outer indentation level",
                    line,
                    column,
                ));
            }
        }
        Ok(false)
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn lex_name(&mut self) -> Result<(), ParseError> {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance();
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(), Some('"') | Some('\'')) {
            match word.to_ascii_lowercase().as_str() {
                "r" => return self.lex_string_at(true, line, column),
                "u" => return self.lex_string_at(false, line, column),
                "f" | "rf" | "fr" => {
                    return Err(ParseError::new("f-strings are not supported", line, column));
                }
                "b" | "rb" | "br" => {
                    return Err(ParseError::new(
                        "bytes literals are not supported",
                        line,
                        column,
                    ));
                }
                _ => {}
            }
        }

        self.push(TokenKind::Name(word), line, column);
        Ok(())
    }

    fn lex_string(&mut self, raw: bool) -> Result<(), ParseError> {
        let (line, column) = (self.line, self.column);
        self.lex_string_at(raw, line, column)
    }

    fn lex_string_at(&mut self, raw: bool, line: usize, column: usize) -> Result<(), ParseError> {
        let quote = self.advance().unwrap_or('"');
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }

        let mut value = String::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(ParseError::new(
                    "unterminated string literal",
                    line,
                    column,
                ));
            };
            if ch == quote {
                if !triple {
                    self.advance();
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.advance();
                    self.advance();
                    self.advance();
                    break;
                }
                value.push(ch);
                self.advance();
                continue;
            }
            if ch == '\n' && !triple {
                return Err(ParseError::new(
                    "unterminated string literal",
                    line,
                    column,
                ));
            }
            if ch == '\\' {
                self.advance();
                let Some(esc) = self.advance() else {
                    return Err(ParseError::new(
                        "unterminated string literal",
                        line,
                        column,
                    ));
                };
                if raw {
                    value.push('\\');
                    value.push(esc);
                    continue;
                }
                match esc {
                    '\n' => {}
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '\\' => value.push('\\'),
                    '\'' => value.push('\''),
                    '"' => value.push('"'),
                    'x' => value.push(self.lex_hex_escape(2)?),
                    'u' => value.push(self.lex_hex_escape(4)?),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
                continue;
            }
            value.push(ch);
            self.advance();
        }

        self.push(TokenKind::Str(value), line, column);
        Ok(())
    }

    fn lex_hex_escape(&mut self, digits: usize) -> Result<char, ParseError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let d = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("truncated escape sequence"))?;
            self.advance();
            code = code * 16 + d;
        }
        char::from_u32(code).ok_or_else(|| self.error("invalid escape sequence"))
    }

    fn lex_number(&mut self) -> Result<(), ParseError> {
        let (line, column) = (self.line, self.column);

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.advance();
                self.advance();
                let mut digits = String::new();
                while let Some(c) = self.peek() {
                    if c == '_' {
                        self.advance();
                    } else if c.is_digit(radix) {
                        digits.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
                let value = i64::from_str_radix(&digits, radix).map_err(|_| {
                    ParseError::new("invalid integer literal", line, column)
                })?;
                self.push(TokenKind::Int(value), line, column);
                return Ok(());
            }
        }

        let mut text = String::new();
        let mut is_float = false;
        self.take_digits(&mut text);
        if self.peek() == Some('.') {
            is_float = true;
            text.push('.');
            self.advance();
            self.take_digits(&mut text);
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign_then_digit = matches!(self.peek_at(1), Some('+') | Some('-'))
                && self.peek_at(2).is_some_and(|c| c.is_ascii_digit());
            if sign_then_digit || self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push('e');
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.advance();
                }
                self.take_digits(&mut text);
            }
        }
        if self
            .peek()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        {
            return Err(self.error("invalid decimal literal"));
        }

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| ParseError::new(format!("invalid number: {text}"), line, column))?;
            self.push(TokenKind::Float(value), line, column);
        } else {
            let value: i64 = text.parse().map_err(|_| {
                ParseError::new(format!("integer literal too large: {text}"), line, column)
            })?;
            self.push(TokenKind::Int(value), line, column);
        }
        Ok(())
    }

    fn take_digits(&mut self, out: &mut String) {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                out.push(c);
                self.advance();
            } else if c == '_' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn lex_operator(&mut self) -> Result<(), ParseError> {
        let (line, column) = (self.line, self.column);
        for op in OPERATORS {
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                for _ in 0..op.chars().count() {
                    self.advance();
                }
                match *op {
                    "(" | "[" | "{" => self.paren_depth += 1,
                    ")" | "]" | "}" => self.paren_depth = self.paren_depth.saturating_sub(1),
                    _ => {}
                }
                self.push(TokenKind::Op(op), line, column);
                return Ok(());
            }
        }
        let ch = self.peek().unwrap_or(' ');
        Err(ParseError::new(
            format!("invalid character '{ch}'"),
            line,
            column,
        ))
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn simple_assignment() {
        assert_eq!(
            kinds("result = 1 + 2"),
            vec![
                TokenKind::Name("result".into()),
                TokenKind::Op("="),
                TokenKind::Int(1),
                TokenKind::Op("+"),
                TokenKind::Int(2),
                TokenKind::Newline,
                TokenKind::EndOfInput,
            ]
        );
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(toks.contains(&TokenKind::Indent));
        assert!(toks.contains(&TokenKind::Dedent));
        let indent_pos = toks.iter().position(|t| *t == TokenKind::Indent).unwrap();
        let dedent_pos = toks.iter().position(|t| *t == TokenKind::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn blank_and_comment_lines_are_ignored() {
        let toks = kinds("# header\n\nx = 1  # trailing\n\n   # indented comment\ny = 2\n");
        assert!(!toks.contains(&TokenKind::Indent));
        assert_eq!(toks.iter().filter(|t| **t == TokenKind::Newline).count(), 2);
    }

    #[test]
    fn brackets_join_lines() {
        let toks = kinds("x = [1,\n     2,\n     3]\n");
        assert_eq!(toks.iter().filter(|t| **t == TokenKind::Newline).count(), 1);
        assert!(!toks.contains(&TokenKind::Indent));
    }

    #[test]
    fn backslash_continuation() {
        let toks = kinds("x = 1 + \\\n    2\n");
        assert_eq!(toks.iter().filter(|t| **t == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("1_000")[0], TokenKind::Int(1000));
        assert_eq!(kinds("0x1f")[0], TokenKind::Int(31));
        assert_eq!(kinds("0b101")[0], TokenKind::Int(5));
        assert_eq!(kinds("2.5")[0], TokenKind::Float(2.5));
        assert_eq!(kinds(".5")[0], TokenKind::Float(0.5));
        assert_eq!(kinds("1e-3")[0], TokenKind::Float(0.001));
        assert_eq!(kinds("3.")[0], TokenKind::Float(3.0));
    }

    #[test]
    fn integer_literal_overflow_is_an_error() {
        let err = tokenize("x = 99999999999999999999").unwrap_err();
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(kinds("'a\\nb'")[0], TokenKind::Str("a\nb".into()));
        assert_eq!(kinds("r'a\\nb'")[0], TokenKind::Str("a\\nb".into()));
        assert_eq!(
            kinds("\"\"\"doc\nstring\"\"\"")[0],
            TokenKind::Str("doc\nstring".into())
        );
    }

    #[test]
    fn f_strings_rejected() {
        let err = tokenize("x = f'{y}'").unwrap_err();
        assert!(err.message.contains("f-strings"));
    }

    #[test]
    fn unterminated_string() {
        let err = tokenize("x = 'abc\ny = 1").unwrap_err();
        assert!(err.message.contains("unterminated"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn bad_dedent() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn operators_longest_match() {
        let toks = kinds("a **= 2 // 3");
        assert_eq!(toks[1], TokenKind::Op("**="));
        assert_eq!(toks[3], TokenKind::Op("//"));
    }

    #[test]
    fn positions_are_one_based() {
        let toks = tokenize("x = 1\n  \ny = $").unwrap_err();
        assert_eq!(toks.line, 3);
        assert_eq!(toks.column, 5);
    }

    #[test]
    fn keyword_lookup() {
        assert!(is_keyword("import"));
        assert!(is_keyword("lambda"));
        assert!(!is_keyword("result"));
    }
}
