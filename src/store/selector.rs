use std::collections::BTreeMap;

use crate::model::ObjectMeta;

/// Label-based filter for list and watch operations.
///
/// An empty selector matches everything. With multiple requirements, all
/// must hold.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    equals: BTreeMap<String, String>,
    exists: Vec<String>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key` to be present with exactly `value`.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    /// Require `key` to be present, with any value.
    pub fn has(mut self, key: impl Into<String>) -> Self {
        self.exists.push(key.into());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| meta.labels.get(k) == Some(v))
            && self.exists.iter().all(|k| meta.labels.contains_key(k))
    }
}
