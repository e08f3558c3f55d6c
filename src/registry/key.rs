//! Composite cache keys
//!
//! Producers derive one string per logical request. `CacheKey` builds such a
//! string from a family name, identifying parts and named options, so two
//! requests that differ in any option never share an entry.

use std::collections::BTreeMap;
use std::fmt;

/// Deterministic composite key
///
/// Renders as `family: part|part|name:value|name:value`. Options are sorted by
/// name, so the order in which they were added does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Data-source family (e.g., "firestore doc")
    pub family: String,
    /// Identifying parts (e.g., a document path)
    pub parts: Vec<String>,
    /// Named option flags
    pub options: BTreeMap<String, String>,
}

impl CacheKey {
    /// Create a key for a data-source family
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            parts: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    /// Append an identifying part
    pub fn part(mut self, part: impl fmt::Display) -> Self {
        self.parts.push(part.to_string());
        self
    }

    /// Set a named option, replacing any earlier value for the same name
    pub fn option(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.options.insert(name.into(), value.to_string());
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.family)?;

        let mut parts = self.parts.iter();
        if let Some(first) = parts.next() {
            write!(f, ": {}", first)?;
            for part in parts {
                write!(f, "|{}", part)?;
            }
        }

        for (name, value) in &self.options {
            write!(f, "|{}:{}", name, value)?;
        }

        Ok(())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

impl From<&CacheKey> for String {
    fn from(key: &CacheKey) -> Self {
        key.to_string()
    }
}
