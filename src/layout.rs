use memflow::prelude::v1::*;

use std::collections::HashMap;

use log::*;

/// Byte offsets of structure fields, keyed by `(type, field)`.
///
/// Type names are the bare structure tags (`task_struct`, not `struct task_struct`).
#[derive(Clone, Debug, Default)]
pub struct TypeLayout {
    fields: HashMap<(String, String), usize>,
}

impl TypeLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, ty: &str, field: &str, offset: usize) -> Self {
        self.insert(ty, field, offset);
        self
    }

    pub fn insert(&mut self, ty: &str, field: &str, offset: usize) {
        self.fields
            .insert((ty.to_string(), field.to_string()), offset);
    }

    pub fn offset(&self, ty: &str, field: &str) -> Result<usize> {
        self.fields
            .get(&(ty.to_string(), field.to_string()))
            .copied()
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses an offsets file.
    ///
    /// Each line holds `type.field offset` with an optional `=` in between.
    /// Offsets are decimal or `0x` prefixed hex, `#` starts a comment.
    ///
    /// ```text
    /// # arm64, 5.10
    /// task_struct.comm = 0x6e8
    /// list_head.prev 8
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let mut layout = Self::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let mut words = line
                .split(|c: char| c.is_whitespace() || c == '=')
                .filter(|w| !w.is_empty());

            let parsed = match (words.next(), words.next(), words.next()) {
                (Some(key), Some(offset), None) => key
                    .split_once('.')
                    .filter(|(ty, field)| !ty.is_empty() && !field.is_empty())
                    .and_then(|(ty, field)| parse_offset(offset).map(|o| (ty, field, o))),
                _ => None,
            };

            match parsed {
                Some((ty, field, offset)) => layout.insert(ty, field, offset),
                None => {
                    warn!("malformed layout entry on line {}: {}", lineno + 1, line);
                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArgument));
                }
            }
        }

        debug!("parsed {} layout entries", layout.len());

        Ok(layout)
    }
}

fn parse_offset(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
