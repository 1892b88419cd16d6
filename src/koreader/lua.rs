//! Reader for the Lua subset KOReader uses in its `metadata.*.lua` sidecars:
//! a single `return { ... }` of nested table constructors holding strings,
//! numbers, booleans and nil.

use crate::error::ParseError;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Nil,
    Boolean(bool),
    /// Kept as written so page numbers render the way KOReader stored them.
    Number(String),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LuaValue {
    Scalar(Scalar),
    Mapping(Vec<(String, LuaValue)>),
    Sequence(Vec<LuaValue>),
}

impl LuaValue {
    pub fn get(&self, key: &str) -> Option<&LuaValue> {
        match self {
            LuaValue::Mapping(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Scalar rendered as text; `nil` and tables have none.
    pub fn as_text(&self) -> Option<String> {
        match self {
            LuaValue::Scalar(Scalar::String(s)) => Some(s.clone()),
            LuaValue::Scalar(Scalar::Number(n)) => Some(n.clone()),
            LuaValue::Scalar(Scalar::Boolean(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Values of a table in key order, whether it ended up a sequence or
    /// a mapping.
    pub fn items(&self) -> Vec<&LuaValue> {
        match self {
            LuaValue::Sequence(items) => items.iter().collect(),
            LuaValue::Mapping(entries) => entries.iter().map(|(_, v)| v).collect(),
            LuaValue::Scalar(_) => Vec::new(),
        }
    }

    pub fn is_table(&self) -> bool {
        !matches!(self, LuaValue::Scalar(_))
    }
}

enum Key {
    Index(i64),
    Name(String),
}

fn scalar_key(value: LuaValue, offset: usize) -> Result<Key, ParseError> {
    match value {
        LuaValue::Scalar(Scalar::Number(n)) => match n.parse::<i64>() {
            Ok(i) => Ok(Key::Index(i)),
            Err(_) => Ok(Key::Name(n)),
        },
        LuaValue::Scalar(Scalar::String(s)) => Ok(Key::Name(s)),
        LuaValue::Scalar(Scalar::Boolean(b)) => Ok(Key::Name(b.to_string())),
        _ => Err(ParseError::new("unsupported table key", offset)),
    }
}

/// Contiguous `1..=n` integer keys become a sequence, anything else a
/// mapping with stringified keys.
fn build_table(entries: Vec<(Key, LuaValue)>) -> LuaValue {
    let contiguous = !entries.is_empty()
        && entries.iter().all(|(k, _)| matches!(k, Key::Index(_)))
        && {
            let mut indices: Vec<i64> = entries
                .iter()
                .filter_map(|(k, _)| match k {
                    Key::Index(i) => Some(*i),
                    Key::Name(_) => None,
                })
                .collect();
            indices.sort_unstable();
            indices.iter().enumerate().all(|(pos, i)| *i == pos as i64 + 1)
        };

    if contiguous {
        let mut indexed: Vec<(i64, LuaValue)> = entries
            .into_iter()
            .filter_map(|(k, v)| match k {
                Key::Index(i) => Some((i, v)),
                Key::Name(_) => None,
            })
            .collect();
        indexed.sort_by_key(|(i, _)| *i);
        return LuaValue::Sequence(indexed.into_iter().map(|(_, v)| v).collect());
    }

    LuaValue::Mapping(
        entries
            .into_iter()
            .map(|(k, v)| match k {
                Key::Index(i) => (i.to_string(), v),
                Key::Name(n) => (n, v),
            })
            .collect(),
    )
}

/// Byte-cursor parser over a metadata chunk.
pub struct LuaParser<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> LuaParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.pos)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.data.get(self.pos + ahead).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    /// Level of a long bracket (`[[`, `[==[`) starting at the cursor.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        (self.peek_at(1 + level) == Some(b'[')).then_some(level)
    }

    fn read_long_bracket(&mut self, level: usize) -> Result<String, ParseError> {
        let start_offset = self.pos;
        self.pos += level + 2;
        // A newline right after the opening bracket is not part of the string.
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }

        let body_start = self.pos;
        while self.pos < self.data.len() {
            if self.data[self.pos] == b']' {
                let closes = (1..=level).all(|i| self.peek_at(i) == Some(b'='))
                    && self.peek_at(level + 1) == Some(b']');
                if closes {
                    let body = String::from_utf8_lossy(&self.data[body_start..self.pos]).into_owned();
                    self.pos += level + 2;
                    return Ok(body);
                }
            }
            self.pos += 1;
        }
        Err(ParseError::new("unfinished long bracket", start_offset))
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.pos += 2;
                    if let Some(level) = self.long_bracket_level() {
                        self.read_long_bracket(level)?;
                    } else {
                        while let Some(b) = self.peek() {
                            if b == b'\n' {
                                break;
                            }
                            self.pos += 1;
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_name(&mut self) -> Option<&'a str> {
        let data: &'a [u8] = self.data;
        let start = self.pos;
        match self.peek() {
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.pos += 1,
            _ => return None,
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        std::str::from_utf8(&data[start..self.pos]).ok()
    }

    /// Parses the whole chunk: an optional `return` and one value.
    pub fn parse(&mut self) -> Result<LuaValue, ParseError> {
        self.skip_trivia()?;
        let checkpoint = self.pos;
        if self.read_name() != Some("return") {
            self.pos = checkpoint;
        }
        self.skip_trivia()?;
        let value = self.parse_value()?;
        self.skip_trivia()?;
        if self.peek() == Some(b';') {
            self.pos += 1;
            self.skip_trivia()?;
        }
        if self.pos != self.data.len() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(value)
    }

    fn parse_value(&mut self) -> Result<LuaValue, ParseError> {
        match self.peek() {
            Some(b'{') => self.parse_table(),
            Some(b'"') | Some(b'\'') => Ok(LuaValue::Scalar(Scalar::String(self.parse_quoted()?))),
            Some(b'[') => match self.long_bracket_level() {
                Some(level) => Ok(LuaValue::Scalar(Scalar::String(self.read_long_bracket(level)?))),
                None => Err(self.error("unexpected '['")),
            },
            Some(b'-') => {
                self.pos += 1;
                self.skip_trivia()?;
                let number = self.parse_number()?;
                Ok(LuaValue::Scalar(Scalar::Number(format!("-{}", number))))
            }
            Some(b) if b.is_ascii_digit() || (b == b'.' && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit())) => {
                Ok(LuaValue::Scalar(Scalar::Number(self.parse_number()?)))
            }
            Some(_) => {
                let offset = self.pos;
                match self.read_name() {
                    Some("true") => Ok(LuaValue::Scalar(Scalar::Boolean(true))),
                    Some("false") => Ok(LuaValue::Scalar(Scalar::Boolean(false))),
                    Some("nil") => Ok(LuaValue::Scalar(Scalar::Nil)),
                    Some(other) => Err(ParseError::new(format!("unexpected identifier '{}'", other), offset)),
                    None => Err(self.error("unexpected character")),
                }
            }
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_number(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let hex = self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X'));
        if hex {
            self.pos += 2;
        }
        let exponent_markers: &[u8] = if hex { b"pP" } else { b"eE" };

        while let Some(b) = self.peek() {
            let is_digit = if hex { b.is_ascii_hexdigit() } else { b.is_ascii_digit() };
            if is_digit || b == b'.' {
                self.pos += 1;
            } else if exponent_markers.contains(&b) {
                self.pos += 1;
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }

        if self.pos == start || (hex && self.pos == start + 2) {
            return Err(ParseError::new("malformed number", start));
        }
        if matches!(self.peek(), Some(b) if b.is_ascii_alphabetic() || b == b'_') {
            return Err(ParseError::new("malformed number", start));
        }
        Ok(String::from_utf8_lossy(&self.data[start..self.pos]).into_owned())
    }

    fn parse_quoted(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let Some(quote) = self.peek() else {
            return Err(self.error("expected string"));
        };
        self.pos += 1;

        let mut out: Vec<u8> = Vec::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(ParseError::new("unfinished string", start));
            };
            self.pos += 1;
            match b {
                b if b == quote => break,
                b'\n' => return Err(ParseError::new("unfinished string", start)),
                b'\\' => self.parse_escape(&mut out)?,
                other => out.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn parse_escape(&mut self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        let Some(b) = self.peek() else {
            return Err(self.error("unfinished escape"));
        };
        self.pos += 1;
        match b {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\\' | b'"' | b'\'' => out.push(b),
            b'\n' => {
                out.push(b'\n');
                if self.peek() == Some(b'\r') {
                    self.pos += 1;
                }
            }
            b'\r' => {
                out.push(b'\n');
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
            }
            b'z' => {
                while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
                    self.pos += 1;
                }
            }
            b'x' => {
                let hex = self
                    .data
                    .get(self.pos..self.pos + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| self.error("invalid \\x escape"))?;
                out.push(hex);
                self.pos += 2;
            }
            b'u' => {
                self.expect(b'{')?;
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                    self.pos += 1;
                }
                let code = std::str::from_utf8(&self.data[start..self.pos])
                    .ok()
                    .and_then(|h| u32::from_str_radix(h, 16).ok())
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error("invalid \\u escape"))?;
                self.expect(b'}')?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(code.encode_utf8(&mut buf).as_bytes());
            }
            d if d.is_ascii_digit() => {
                let mut value = u32::from(d - b'0');
                for _ in 0..2 {
                    match self.peek() {
                        Some(c) if c.is_ascii_digit() => {
                            value = value * 10 + u32::from(c - b'0');
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                let byte = u8::try_from(value).map_err(|_| self.error("decimal escape too large"))?;
                out.push(byte);
            }
            other => return Err(self.error(format!("invalid escape '\\{}'", other as char))),
        }
        Ok(())
    }

    fn parse_table(&mut self) -> Result<LuaValue, ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("tables nested too deeply"));
        }
        self.depth += 1;
        self.expect(b'{')?;

        let mut entries: Vec<(Key, LuaValue)> = Vec::new();
        let mut next_index = 1;
        loop {
            self.skip_trivia()?;
            if self.peek() == Some(b'}') {
                self.pos += 1;
                break;
            }

            let field_offset = self.pos;
            if self.peek() == Some(b'[') && self.long_bracket_level().is_none() {
                self.pos += 1;
                self.skip_trivia()?;
                let key = self.parse_value()?;
                self.skip_trivia()?;
                self.expect(b']')?;
                self.skip_trivia()?;
                self.expect(b'=')?;
                self.skip_trivia()?;
                let value = self.parse_value()?;
                entries.push((scalar_key(key, field_offset)?, value));
            } else if let Some(name) = self.named_field_key() {
                self.skip_trivia()?;
                let value = self.parse_value()?;
                entries.push((Key::Name(name.to_string()), value));
            } else {
                let value = self.parse_value()?;
                entries.push((Key::Index(next_index), value));
                next_index += 1;
            }

            self.skip_trivia()?;
            match self.peek() {
                Some(b',') | Some(b';') => self.pos += 1,
                Some(b'}') => {}
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }

        self.depth -= 1;
        Ok(build_table(entries))
    }

    /// `name =` field prefix. Leaves the cursor untouched if absent.
    fn named_field_key(&mut self) -> Option<&'a str> {
        let checkpoint = self.pos;
        let name = self.read_name()?;
        if matches!(name, "true" | "false" | "nil") {
            self.pos = checkpoint;
            return None;
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'=') && self.peek_at(1) != Some(b'=') {
            self.pos += 1;
            Some(name)
        } else {
            self.pos = checkpoint;
            None
        }
    }
}

/// Parses a complete metadata chunk into its returned value.
pub fn parse(text: &str) -> Result<LuaValue, ParseError> {
    LuaParser::new(text.as_bytes()).parse()
}
