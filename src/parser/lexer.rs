//! Lexer for the logic dialect.
//!
//! Produces a flat token stream with 1-based line/column positions. All
//! lexical failures (unknown escape, unterminated string, stray characters)
//! surface as `Parse` errors carrying the offending span.

use crate::error::{KernelError, KernelResult, Span};

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Bare identifier: predicate names, variables, keywords.
    Ident(String),
    /// `fn:`-prefixed function name, stored without the prefix
    /// (e.g. `plus`, `group_by`, `list:length`).
    FnName(String),
    /// Name-constant, stored without the leading `/`.
    NameConst(String),
    /// String literal, unescaped.
    Str(String),
    /// Single-quoted annotation argument, e.g. `'+'`.
    Quoted(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Period,
    Question,
    Colon,
    Implies,  // :-
    Pipe,     // |>
    Bang,     // !
    Eq,       // =
    Ne,       // !=
    Lt,
    Le,
    Gt,
    Ge,
}

impl Tok {
    /// Human-readable shape for error messages.
    pub fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier '{}'", s),
            Tok::FnName(s) => format!("function 'fn:{}'", s),
            Tok::NameConst(s) => format!("name constant '/{}'", s),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Quoted(s) => format!("'{}'", s),
            Tok::Int(v) => format!("integer {}", v),
            Tok::Float(v) => format!("float {}", v),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Period => "'.'".to_string(),
            Tok::Question => "'?'".to_string(),
            Tok::Colon => "':'".to_string(),
            Tok::Implies => "':-'".to_string(),
            Tok::Pipe => "'|>'".to_string(),
            Tok::Bang => "'!'".to_string(),
            Tok::Eq => "'='".to_string(),
            Tok::Ne => "'!='".to_string(),
            Tok::Lt => "'<'".to_string(),
            Tok::Le => "'<='".to_string(),
            Tok::Gt => "'>'".to_string(),
            Tok::Ge => "'>='".to_string(),
        }
    }
}

/// A token plus its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    col: u32,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Cursor {
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn span(&self) -> Span {
        Span::new(self.line, self.col)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Tokenise a full source text.
pub fn tokenize(source: &str) -> KernelResult<Vec<Token>> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();

    loop {
        // Skip whitespace and `#` line comments.
        loop {
            match cursor.peek() {
                Some(c) if c.is_whitespace() => {
                    cursor.bump();
                }
                Some('#') => {
                    while let Some(c) = cursor.peek() {
                        if c == '\n' {
                            break;
                        }
                        cursor.bump();
                    }
                }
                _ => break,
            }
        }

        let span = cursor.span();
        let Some(c) = cursor.peek() else { break };

        let tok = match c {
            '(' => {
                cursor.bump();
                Tok::LParen
            }
            ')' => {
                cursor.bump();
                Tok::RParen
            }
            '[' => {
                cursor.bump();
                Tok::LBracket
            }
            ']' => {
                cursor.bump();
                Tok::RBracket
            }
            '{' => {
                cursor.bump();
                Tok::LBrace
            }
            '}' => {
                cursor.bump();
                Tok::RBrace
            }
            ',' => {
                cursor.bump();
                Tok::Comma
            }
            '?' => {
                cursor.bump();
                Tok::Question
            }
            '=' => {
                cursor.bump();
                Tok::Eq
            }
            '<' => {
                cursor.bump();
                if cursor.eat('=') {
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            '>' => {
                cursor.bump();
                if cursor.eat('=') {
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            '!' => {
                cursor.bump();
                if cursor.eat('=') {
                    Tok::Ne
                } else {
                    Tok::Bang
                }
            }
            ':' => {
                cursor.bump();
                if cursor.eat('-') {
                    Tok::Implies
                } else {
                    Tok::Colon
                }
            }
            '|' => {
                cursor.bump();
                if cursor.eat('>') {
                    Tok::Pipe
                } else {
                    return Err(KernelError::parse(span, "expected '|>'"));
                }
            }
            '/' => {
                cursor.bump();
                lex_name_constant(&mut cursor, span)?
            }
            '"' => {
                cursor.bump();
                lex_string(&mut cursor, span)?
            }
            '\'' => {
                cursor.bump();
                lex_quoted(&mut cursor, span)?
            }
            '.' => {
                cursor.bump();
                Tok::Period
            }
            '-' => {
                cursor.bump();
                match cursor.peek() {
                    Some(d) if d.is_ascii_digit() => lex_number(&mut cursor, span, true)?,
                    _ => return Err(KernelError::parse(span, "expected digit after '-'")),
                }
            }
            c if c.is_ascii_digit() => lex_number(&mut cursor, span, false)?,
            c if is_ident_start(c) => lex_ident(&mut cursor, span)?,
            other => {
                return Err(KernelError::parse(
                    span,
                    format!("unexpected character '{}'", other),
                ));
            }
        };

        tokens.push(Token { tok, span });
    }

    Ok(tokens)
}

/// After the leading `/`: segments of name chars, optionally separated by
/// further slashes (`/task/phase`).
fn lex_name_constant(cursor: &mut Cursor<'_>, span: Span) -> KernelResult<Tok> {
    let mut text = String::new();
    loop {
        match cursor.peek() {
            Some(c) if is_name_char(c) => {
                text.push(c);
                cursor.bump();
            }
            Some('/') if !text.is_empty() && text.as_bytes().last() != Some(&b'/') => {
                text.push('/');
                cursor.bump();
            }
            _ => break,
        }
    }
    if text.is_empty() || text.ends_with('/') {
        return Err(KernelError::parse(span, "malformed name constant"));
    }
    Ok(Tok::NameConst(text))
}

fn lex_string(cursor: &mut Cursor<'_>, span: Span) -> KernelResult<Tok> {
    let mut text = String::new();
    loop {
        let pos = cursor.span();
        match cursor.bump() {
            None | Some('\n') => {
                return Err(KernelError::parse(span, "unterminated string literal"));
            }
            Some('"') => break,
            Some('\\') => {
                let esc = cursor
                    .bump()
                    .ok_or_else(|| KernelError::parse(span, "unterminated string literal"))?;
                match esc {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '\\' => text.push('\\'),
                    '"' => text.push('"'),
                    other => {
                        return Err(KernelError::parse(
                            pos,
                            format!("unknown escape sequence '\\{}'", other),
                        ));
                    }
                }
            }
            Some(c) => text.push(c),
        }
    }
    Ok(Tok::Str(text))
}

/// Single-quoted annotation arguments: `'+'`, `'-'`.
fn lex_quoted(cursor: &mut Cursor<'_>, span: Span) -> KernelResult<Tok> {
    let mut text = String::new();
    loop {
        match cursor.bump() {
            None | Some('\n') => {
                return Err(KernelError::parse(span, "unterminated quoted literal"));
            }
            Some('\'') => break,
            Some(c) => text.push(c),
        }
    }
    Ok(Tok::Quoted(text))
}

fn lex_number(cursor: &mut Cursor<'_>, span: Span, negative: bool) -> KernelResult<Tok> {
    let mut digits = String::new();
    if negative {
        digits.push('-');
    }
    while let Some(c) = cursor.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
            cursor.bump();
        } else {
            break;
        }
    }

    // A '.' is part of the number only when a digit follows; otherwise it is
    // the clause terminator (`foo(1).`).
    let mut is_float = false;
    if cursor.peek() == Some('.') {
        let mut lookahead = cursor.chars.clone();
        lookahead.next();
        if lookahead.peek().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            digits.push('.');
            cursor.bump();
            while let Some(c) = cursor.peek() {
                if c.is_ascii_digit() {
                    digits.push(c);
                    cursor.bump();
                } else {
                    break;
                }
            }
        }
    }

    if is_float {
        digits
            .parse::<f64>()
            .map(Tok::Float)
            .map_err(|_| KernelError::parse(span, format!("malformed float '{}'", digits)))
    } else {
        digits
            .parse::<i64>()
            .map(Tok::Int)
            .map_err(|_| KernelError::parse(span, format!("integer out of range '{}'", digits)))
    }
}

fn lex_ident(cursor: &mut Cursor<'_>, span: Span) -> KernelResult<Tok> {
    let mut text = String::new();
    while let Some(c) = cursor.peek() {
        if is_ident_continue(c) {
            text.push(c);
            cursor.bump();
        } else {
            break;
        }
    }

    // `fn:` introduces a function name, which may itself contain ':'
    // namespace segments (`fn:list:length`).
    if text == "fn" && cursor.peek() == Some(':') {
        cursor.bump();
        let mut name = String::new();
        loop {
            match cursor.peek() {
                Some(c) if is_ident_continue(c) => {
                    name.push(c);
                    cursor.bump();
                }
                Some(':') if !name.is_empty() => {
                    // Only continue across ':' when another segment follows;
                    // `fn:plus:` would otherwise swallow a rule's ':-'.
                    let mut lookahead = cursor.chars.clone();
                    lookahead.next();
                    if lookahead.peek().is_some_and(|c| is_ident_continue(*c)) {
                        name.push(':');
                        cursor.bump();
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        if name.is_empty() {
            return Err(KernelError::parse(span, "expected function name after 'fn:'"));
        }
        return Ok(Tok::FnName(name));
    }

    Ok(Tok::Ident(text))
}
