//! Bounded table of deduplicated diagnostic names.
//!
//! Source file names and file display names are stored once and referred to
//! by [`NameId`]. Records hold ids, never the strings.

use std::collections::HashMap;

use crate::error::InternError;

/// Handle to an interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(u32);

/// Capacity-bounded string interner.
#[derive(Debug)]
pub struct NameTable {
    names: Vec<Box<str>>,
    index: HashMap<Box<str>, NameId>,
    capacity: usize,
    max_len: usize,
}

impl NameTable {
    #[must_use]
    pub fn new(capacity: usize, max_len: usize) -> Self {
        Self {
            names: Vec::new(),
            index: HashMap::new(),
            capacity,
            max_len,
        }
    }

    /// Look up or insert `name`, truncated to the table's maximum length.
    pub fn intern(&mut self, name: &str) -> Result<NameId, InternError> {
        let name = truncate_on_char_boundary(name, self.max_len);
        if let Some(&id) = self.index.get(name) {
            return Ok(id);
        }
        if self.names.len() >= self.capacity {
            return Err(InternError::TableFull {
                capacity: self.capacity,
            });
        }
        let id = NameId(u32::try_from(self.names.len()).map_err(|_| InternError::TableFull {
            capacity: self.capacity,
        })?);
        self.names.push(name.into());
        self.index.insert(name.into(), id);
        Ok(id)
    }

    /// The string behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` came from a different table.
    #[must_use]
    pub fn resolve(&self, id: NameId) -> &str {
        &self.names[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

fn truncate_on_char_boundary(name: &str, max_len: usize) -> &str {
    if name.len() <= max_len {
        return name;
    }
    let mut end = max_len;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
