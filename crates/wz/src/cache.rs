//! String interning for a single write or read pass

use indexmap::IndexMap;

/// Strings with at most this many characters are always written inline
pub const INLINE_LIMIT: usize = 4;

fn interned(s: &str) -> bool {
    s.chars().count() > INLINE_LIMIT
}

/// Offsets of strings already emitted during a write pass
///
/// Values map to the position directly after their tag byte, relative to the start of the
/// current image. Directory object names map to the position of their type byte relative to
/// the archive's data start and are keyed by type, since the type byte is part of the entry.
#[derive(Debug, Default, Clone)]
pub struct StringCache {
    values: IndexMap<Box<str>, u32>,
    objects: IndexMap<(u8, Box<str>), u32>,
}

impl StringCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of a previously written value, if it may be referenced
    pub fn value(&self, s: &str) -> Option<u32> {
        if !interned(s) {
            return None;
        }
        self.values.get(s).copied()
    }

    /// Records the offset of a value. The first recorded offset wins.
    pub fn insert_value(&mut self, s: &str, offset: u32) {
        if interned(s) {
            self.values.entry(s.into()).or_insert(offset);
        }
    }

    /// Offset of a previously written directory entry name
    pub fn object(&self, kind: u8, s: &str) -> Option<u32> {
        if !interned(s) {
            return None;
        }
        self.objects.get(&(kind, Box::from(s))).copied()
    }

    /// Records the offset of a directory entry name. The first recorded offset wins.
    pub fn insert_object(&mut self, kind: u8, s: &str, offset: u32) {
        if interned(s) {
            self.objects.entry((kind, s.into())).or_insert(offset);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.objects.clear();
    }
}

/// Strings decoded during a read pass, keyed by their absolute offset
#[derive(Debug, Default, Clone)]
pub struct ReadCache {
    strings: IndexMap<u64, Box<str>>,
}

impl ReadCache {
    pub fn get(&self, offset: u64) -> Option<&str> {
        self.strings.get(&offset).map(|s| s.as_ref())
    }

    pub fn insert(&mut self, offset: u64, s: &str) {
        self.strings.insert(offset, s.into());
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn clear(&mut self) {
        self.strings.clear();
    }
}
