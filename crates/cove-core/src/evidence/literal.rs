//! Parser for the literal notation evidence cells are stored in
//! (`['a', "b"]`, `{'source': 'x'}`, tuples, numbers, `True`/`False`/`None`).

use std::fmt::Write as _;

use thiserror::Error;

/// Deepest container nesting accepted before the input is rejected.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid literal at byte {offset}: {reason}")]
pub struct LiteralError {
    pub offset: usize,
    pub reason: String,
}

pub fn parse(input: &str) -> Result<Literal, LiteralError> {
    let mut parser = Parser {
        src: input,
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != input.len() {
        return Err(parser.error("trailing characters after literal"));
    }
    Ok(value)
}

impl Literal {
    /// Text form used when a non-string scalar becomes an evidence item.
    pub fn to_text(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Literal notation, round-trippable through [`parse`].
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out);
        out
    }

    fn write_repr(&self, out: &mut String) {
        match self {
            Literal::None => out.push_str("None"),
            Literal::Bool(true) => out.push_str("True"),
            Literal::Bool(false) => out.push_str("False"),
            Literal::Int(v) => {
                let _ = write!(out, "{v}");
            }
            Literal::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
                    let _ = write!(out, "{v:.1}");
                } else {
                    let _ = write!(out, "{v}");
                }
            }
            Literal::Str(s) => {
                out.push('\'');
                for ch in s.chars() {
                    match ch {
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("\\'"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
            }
            Literal::List(items) => write_seq(out, '[', ']', items, false),
            Literal::Tuple(items) => write_seq(out, '(', ')', items, items.len() == 1),
            Literal::Dict(entries) => {
                out.push('{');
                for (idx, (key, value)) in entries.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    key.write_repr(out);
                    out.push_str(": ");
                    value.write_repr(out);
                }
                out.push('}');
            }
        }
    }
}

fn write_seq(out: &mut String, open: char, close: char, items: &[Literal], trailing: bool) {
    out.push(open);
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        item.write_repr(out);
    }
    if trailing {
        out.push(',');
    }
    out.push(close);
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> LiteralError {
        LiteralError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), LiteralError> {
        match self.bump() {
            Some(ch) if ch == wanted => Ok(()),
            Some(ch) => Err(self.error(format!("expected '{wanted}', found '{ch}'"))),
            None => Err(self.error(format!("expected '{wanted}', found end of input"))),
        }
    }

    fn value(&mut self) -> Result<Literal, LiteralError> {
        self.skip_ws();
        match self.peek() {
            Some(open @ ('[' | '(' | '{')) => {
                if self.depth >= MAX_DEPTH {
                    return Err(self.error("literal nested too deeply"));
                }
                self.bump();
                self.depth += 1;
                let parsed = match open {
                    '[' => self.sequence(']').map(Literal::List),
                    '(' => self.sequence(')').map(Literal::Tuple),
                    _ => self.dict(),
                };
                self.depth -= 1;
                parsed
            }
            Some('\'') | Some('"') => self.string_body().map(Literal::Str),
            Some(ch) if ch == '-' || ch == '+' || ch == '.' || ch.is_ascii_digit() => {
                self.number()
            }
            Some(ch) if ch.is_alphabetic() => self.keyword_or_prefixed_string(),
            Some(ch) => Err(self.error(format!("unexpected character '{ch}'"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn sequence(&mut self, close: char) -> Result<Vec<Literal>, LiteralError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(items);
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(ch) if ch == close => return Ok(items),
                Some(ch) => return Err(self.error(format!("expected ',' or '{close}', found '{ch}'"))),
                None => return Err(self.error(format!("unterminated sequence, missing '{close}'"))),
            }
        }
    }

    fn dict(&mut self) -> Result<Literal, LiteralError> {
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Literal::Dict(entries));
            }
            let key = self.value()?;
            self.skip_ws();
            self.expect(':')?;
            let value = self.value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Literal::Dict(entries)),
                Some(ch) => return Err(self.error(format!("expected ',' or '}}', found '{ch}'"))),
                None => return Err(self.error("unterminated mapping, missing '}'")),
            }
        }
    }

    fn keyword_or_prefixed_string(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        let word = &self.src[start..self.pos];
        match word {
            "None" => Ok(Literal::None),
            "True" => Ok(Literal::Bool(true)),
            "False" => Ok(Literal::Bool(false)),
            "nan" | "NaN" => Ok(Literal::None),
            "u" | "U" if matches!(self.peek(), Some('\'') | Some('"')) => {
                self.string_body().map(Literal::Str)
            }
            _ => {
                self.pos = start;
                Err(self.error(format!("unknown name '{word}'")))
            }
        }
    }

    fn string_body(&mut self) -> Result<String, LiteralError> {
        let quote = self.bump().ok_or_else(|| self.error("expected string"))?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(ch) if ch == quote => break,
                Some('\\') => {
                    let escaped = self.bump().ok_or_else(|| self.error("dangling escape"))?;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        '\n' => {}
                        'x' => out.push(self.hex_escape(2)?),
                        'u' => out.push(self.hex_escape(4)?),
                        'U' => out.push(self.hex_escape(8)?),
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                Some(ch) => out.push(ch),
            }
        }
        Ok(out)
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, LiteralError> {
        let end = self.pos + digits;
        let hex = self
            .src
            .get(self.pos..end)
            .ok_or_else(|| self.error("truncated escape"))?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| self.error("invalid hex escape"))?;
        self.pos = end;
        char::from_u32(code).ok_or_else(|| self.error("escape is not a valid character"))
    }

    fn number(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '+' | '.' | '_') {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        let text = self.src[start..self.pos].replace('_', "");
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Literal::Int(int));
        }
        text.parse::<f64>().map(Literal::Float).map_err(|_| {
            let mut err = self.error(format!("invalid number '{text}'"));
            err.offset = start;
            err
        })
    }
}
