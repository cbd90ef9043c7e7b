//! Store configuration trees.
//!
//! The router hands every store a `StoreOptions` tree parsed from the server
//! configuration: scalar options plus nested sections for child store
//! definitions (a buffer store's `primary`/`secondary`, a multi store's
//! `store0..N`, a bucket store's `bucket` model).
//!
//! Unknown keys warn and are otherwise ignored, so configurations stay
//! forward- and backward-compatible across server versions. Booleans accept
//! `yes/no/true/false/1/0` in string form.

use std::collections::BTreeMap;

use serde::Deserialize;

/// One value in an options tree
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Native boolean
    Bool(bool),

    /// Integer scalar
    Int(i64),

    /// String scalar (numbers and booleans are also accepted in this form)
    Str(String),

    /// Nested section, usually a child store definition
    Section(StoreOptions),
}

/// A tree of configuration options for one store instance.
///
/// # Example
///
/// ```toml
/// type = "buffer"
/// retry_interval = 120
///
/// [primary]
/// type = "network"
/// remote_host = "sluice-central"
/// remote_port = 1463
///
/// [secondary]
/// type = "file"
/// file_path = "/var/spool/sluice"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct StoreOptions {
    entries: BTreeMap<String, OptionValue>,
}

impl StoreOptions {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous one under the same key
    pub fn insert(&mut self, key: impl Into<String>, value: OptionValue) {
        self.entries.insert(key.into(), value);
    }

    /// Builder form: string value
    #[must_use]
    pub fn with_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, OptionValue::Str(value.into()));
        self
    }

    /// Builder form: integer value
    #[must_use]
    pub fn with_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.insert(key, OptionValue::Int(value));
        self
    }

    /// Builder form: boolean value
    #[must_use]
    pub fn with_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.insert(key, OptionValue::Bool(value));
        self
    }

    /// Builder form: nested section
    #[must_use]
    pub fn with_section(mut self, key: impl Into<String>, section: StoreOptions) -> Self {
        self.insert(key, OptionValue::Section(section));
        self
    }

    /// True if the key is present (any value kind)
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries at this level
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries at this level
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// String form of a scalar value
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.entries.get(key)? {
            OptionValue::Str(s) => Some(s.clone()),
            OptionValue::Int(i) => Some(i.to_string()),
            OptionValue::Bool(b) => Some(b.to_string()),
            OptionValue::Section(_) => None,
        }
    }

    /// Unsigned integer value; string scalars are parsed
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.entries.get(key)? {
            OptionValue::Int(i) if *i >= 0 => Some(*i as u64),
            OptionValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean value; accepts `yes/no/true/false/1/0` in string form
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key)? {
            OptionValue::Bool(b) => Some(*b),
            OptionValue::Int(0) => Some(false),
            OptionValue::Int(1) => Some(true),
            OptionValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "yes" | "true" | "1" => Some(true),
                "no" | "false" | "0" => Some(false),
                other => {
                    tracing::warn!(key, value = other, "unrecognized boolean value");
                    None
                }
            },
            _ => None,
        }
    }

    /// Nested section under a key
    pub fn section(&self, key: &str) -> Option<&StoreOptions> {
        match self.entries.get(key)? {
            OptionValue::Section(section) => Some(section),
            _ => None,
        }
    }

    /// Warn (once per configure call) about keys this store does not
    /// recognize. `type` is always recognized; it belongs to the factory.
    pub fn warn_unknown(&self, recognized: &[&str], store_type: &str, category: &str) {
        for key in self.entries.keys() {
            if key != "type" && !recognized.contains(&key.as_str()) {
                tracing::warn!(
                    store = store_type,
                    category,
                    key = %key,
                    "unknown configuration option"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "options_test.rs"]
mod options_test;
