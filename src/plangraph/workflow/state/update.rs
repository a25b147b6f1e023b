// SPDX-License-Identifier: MIT

//! Partial state updates returned by nodes and supplied by the host

use serde_json::{Map, Value};

/// How an entry is combined with the current value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Use the field's declared reducer
    Reduce,
    /// Bypass the reducer and overwrite (e.g. resetting a summed counter)
    Replace,
}

/// A single field update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntry {
    pub key: String,
    pub value: Value,
    pub mode: UpdateMode,
}

/// Ordered list of field updates, applied in emission order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    entries: Vec<UpdateEntry>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry merged with the field's reducer
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.push(key, value, UpdateMode::Reduce);
        self
    }

    /// Add an entry that overwrites regardless of the field's reducer
    pub fn replace(mut self, key: &str, value: Value) -> Self {
        self.push(key, value, UpdateMode::Replace);
        self
    }

    pub fn push(&mut self, key: &str, value: Value, mode: UpdateMode) {
        self.entries.push(UpdateEntry {
            key: key.to_string(),
            value,
            mode,
        });
    }

    /// Append all entries of `other` after this update's entries
    pub fn merge(mut self, other: StateUpdate) -> Self {
        self.entries.extend(other.entries);
        self
    }

    /// Build a reducer-mode update from a JSON object
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self::from_map(map)),
            _ => None,
        }
    }

    fn from_map(map: Map<String, Value>) -> Self {
        let mut update = Self::new();
        for (key, value) in map {
            update.push(&key, value, UpdateMode::Reduce);
        }
        update
    }

    /// Last value written for `key`, if any
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| &e.value)
    }

    pub fn entries(&self) -> &[UpdateEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_keeps_order_and_modes() {
        let update = StateUpdate::new()
            .with("errors", json!(["a"]))
            .replace("retries", json!(0))
            .with("errors", json!(["b"]));

        let entries = update.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].mode, UpdateMode::Reduce);
        assert_eq!(entries[1].mode, UpdateMode::Replace);
        assert_eq!(update.get("errors"), Some(&json!(["b"])));
    }

    #[test]
    fn test_from_json() {
        let update = StateUpdate::from_json(json!({"scratch": {"approved": true}})).unwrap();
        assert_eq!(update.get("scratch"), Some(&json!({"approved": true})));
        assert!(StateUpdate::from_json(json!([1, 2])).is_none());
    }

    #[test]
    fn test_merge() {
        let a = StateUpdate::new().with("a", json!(1));
        let b = StateUpdate::new().with("b", json!(2));
        let merged = a.merge(b);
        assert_eq!(merged.entries().len(), 2);
        assert_eq!(merged.entries()[1].key, "b");
    }
}
