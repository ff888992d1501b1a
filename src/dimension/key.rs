use std::fmt::{self, Write as _};

use uuid::Uuid;

/// Separator between parts of a flat key.
pub const KEY_DELIMITER: char = '_';

/// Separator between levels of a hierarchical key.
pub const HIERARCHY_DELIMITER: char = '/';

/// One typed component of a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart<'a> {
    Str(&'a str),
    Bool(bool),
    Int(i64),
    Id(Uuid),
}

impl fmt::Display for KeyPart<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            Self::Int(i) => write!(f, "{i}"),
            // Uuid's Display is the lowercase hyphenated form.
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

impl<'a> From<&'a str> for KeyPart<'a> {
    fn from(v: &'a str) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for KeyPart<'_> {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for KeyPart<'_> {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u8> for KeyPart<'_> {
    fn from(v: u8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<Uuid> for KeyPart<'_> {
    fn from(v: Uuid) -> Self {
        Self::Id(v)
    }
}

/// Builds a flat `_`-joined key from parts, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct KeyBuilder {
    buf: String,
    parts: usize,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the output buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity),
            parts: 0,
        }
    }

    /// Appends a part.
    pub fn add<'a>(mut self, part: impl Into<KeyPart<'a>>) -> Self {
        push_part(&mut self.buf, &mut self.parts, KEY_DELIMITER, part.into());
        self
    }

    pub fn build(self) -> String {
        self.buf
    }
}

/// Builds a `/`-joined key where each part narrows the previous one
/// (e.g. manager root, then message).
#[derive(Debug, Default, Clone)]
pub struct HierarchicalKeyBuilder {
    buf: String,
    parts: usize,
}

impl HierarchicalKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the next level.
    pub fn add<'a>(mut self, part: impl Into<KeyPart<'a>>) -> Self {
        push_part(
            &mut self.buf,
            &mut self.parts,
            HIERARCHY_DELIMITER,
            part.into(),
        );
        self
    }

    pub fn build(self) -> String {
        self.buf
    }
}

fn push_part(buf: &mut String, parts: &mut usize, delimiter: char, part: KeyPart<'_>) {
    if *parts > 0 {
        buf.push(delimiter);
    }
    // Writing into a String cannot fail.
    let _ = write!(buf, "{part}");
    *parts += 1;
}
