// SPDX-License-Identifier: MIT

//! Runtime state storage for workflow execution

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::schema::{FieldType, ReducerType, StateSchema};
use super::update::{StateUpdate, UpdateMode};
use crate::adk::error::StateError;

/// Runtime workflow state with reducer support.
///
/// States are values: `apply` returns a new state and leaves `self` alone,
/// which is what lets checkpoints hold plain snapshots.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    /// Current state values
    fields: BTreeMap<String, Value>,
    /// Field declarations and reducers
    schema: Arc<StateSchema>,
}

impl WorkflowState {
    /// Create a new WorkflowState seeded with the schema's defaults
    pub fn from_schema(schema: Arc<StateSchema>) -> Self {
        let fields = schema
            .fields
            .iter()
            .filter_map(|(name, def)| def.default.clone().map(|d| (name.clone(), d)))
            .collect();

        Self { fields, schema }
    }

    /// Rebuild a state from a JSON snapshot, validating every field
    pub fn from_snapshot(schema: Arc<StateSchema>, snapshot: &Value) -> Result<Self, StateError> {
        let mut state = Self {
            fields: BTreeMap::new(),
            schema,
        };
        if let Value::Object(map) = snapshot {
            for (key, value) in map {
                let def = state
                    .schema
                    .get(key)
                    .ok_or_else(|| StateError::UnknownField(key.clone()))?;
                check_type(key, def.field_type, value)?;
                state.fields.insert(key.clone(), value.clone());
            }
        }
        Ok(state)
    }

    /// Merge a partial update into a copy of this state
    pub fn apply(&self, update: &StateUpdate) -> Result<Self, StateError> {
        let mut next = self.clone();
        for entry in update.entries() {
            next.merge_field(&entry.key, entry.value.clone(), entry.mode)?;
        }
        Ok(next)
    }

    fn merge_field(&mut self, key: &str, value: Value, mode: UpdateMode) -> Result<(), StateError> {
        let def = self
            .schema
            .get(key)
            .ok_or_else(|| StateError::UnknownField(key.to_string()))?;
        let (field_type, reducer) = (def.field_type, def.reducer);

        if mode == UpdateMode::Replace {
            check_type(key, field_type, &value)?;
            self.fields.insert(key.to_string(), value);
            return Ok(());
        }

        match reducer {
            ReducerType::Overwrite => {
                check_type(key, field_type, &value)?;
                self.fields.insert(key.to_string(), value);
            }
            ReducerType::Append => {
                let arr = self
                    .fields
                    .entry(key.to_string())
                    .or_insert(Value::Array(vec![]));
                if arr.is_null() {
                    *arr = Value::Array(vec![]);
                }
                if let Value::Array(a) = arr {
                    match value {
                        Value::Array(new_items) => a.extend(new_items),
                        Value::Null => {}
                        other => a.push(other),
                    }
                }
            }
            ReducerType::Sum => {
                if !value.is_number() {
                    return Err(mismatch(key, FieldType::Number, &value));
                }
                let sum = add_numbers(self.fields.get(key), &value);
                self.fields.insert(key.to_string(), sum);
            }
            ReducerType::Max | ReducerType::Min => {
                let Some(new) = value.as_f64() else {
                    return Err(mismatch(key, FieldType::Number, &value));
                };
                let replace = match self.fields.get(key).and_then(|v| v.as_f64()) {
                    None => true,
                    Some(current) if reducer == ReducerType::Max => new > current,
                    Some(current) => new < current,
                };
                if replace {
                    self.fields.insert(key.to_string(), value);
                }
            }
            ReducerType::Merge => {
                let new_obj = match value {
                    Value::Object(obj) => obj,
                    Value::Null => return Ok(()),
                    other => return Err(mismatch(key, FieldType::Object, &other)),
                };
                let current = self
                    .fields
                    .entry(key.to_string())
                    .or_insert(Value::Object(Map::new()));
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                if let Value::Object(current_obj) = current {
                    for (k, v) in new_obj {
                        current_obj.insert(k, v);
                    }
                }
            }
            ReducerType::KeepFirst => {
                check_type(key, field_type, &value)?;
                let unset = self.fields.get(key).map_or(true, Value::is_null);
                if unset {
                    self.fields.insert(key.to_string(), value);
                }
            }
        }
        Ok(())
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a nested field value using dot notation (e.g., "scratch.approved")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Decode a field into a Rust type; unset and null fields yield `None`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| StateError::Decode {
                    field: key.to_string(),
                    source,
                }),
        }
    }

    /// Numeric field as u64, treating unset as 0
    pub fn get_u64(&self, key: &str) -> u64 {
        self.fields
            .get(key)
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
            .unwrap_or(0)
    }

    /// Boolean field; `None` when unset or null
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Convert state to JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Get all field names that currently hold a value
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }
}

impl PartialEq for WorkflowState {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Serialize for WorkflowState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

fn check_type(key: &str, expected: FieldType, value: &Value) -> Result<(), StateError> {
    if expected.accepts(value) {
        Ok(())
    } else {
        Err(mismatch(key, expected, value))
    }
}

fn mismatch(key: &str, expected: FieldType, value: &Value) -> StateError {
    let found = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    StateError::TypeMismatch {
        field: key.to_string(),
        expected,
        found: found.to_string(),
    }
}

/// Integer sums stay integers; anything else falls back to f64
fn add_numbers(current: Option<&Value>, delta: &Value) -> Value {
    let current = current.cloned().unwrap_or(Value::from(0));
    match (current.as_i64(), delta.as_i64()) {
        (Some(a), Some(b)) => Value::from(a.saturating_add(b)),
        _ => {
            let sum = current.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0);
            serde_json::Number::from_f64(sum)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_schema(fields: Vec<(&str, FieldType, ReducerType, Option<Value>)>) -> Arc<StateSchema> {
        let mut schema = StateSchema::default();
        for (name, field_type, reducer, default) in fields {
            schema = schema.field(name, field_type, reducer, default);
        }
        Arc::new(schema)
    }

    fn apply(state: &WorkflowState, key: &str, value: Value) -> WorkflowState {
        state
            .apply(&StateUpdate::new().with(key, value))
            .unwrap()
    }

    #[test]
    fn test_state_with_defaults() {
        let schema = make_schema(vec![
            (
                "retries",
                FieldType::Number,
                ReducerType::Sum,
                Some(json!(0)),
            ),
            (
                "stage",
                FieldType::String,
                ReducerType::Overwrite,
                Some(json!("running")),
            ),
            ("plan", FieldType::Object, ReducerType::Overwrite, None),
        ]);
        let state = WorkflowState::from_schema(schema);

        assert_eq!(state.get("retries"), Some(&json!(0)));
        assert_eq!(state.get("stage"), Some(&json!("running")));
        assert!(state.get("plan").is_none());
    }

    #[test]
    fn test_overwrite_reducer() {
        let schema = make_schema(vec![(
            "value",
            FieldType::String,
            ReducerType::Overwrite,
            None,
        )]);
        let state = WorkflowState::from_schema(schema);

        let state = apply(&state, "value", json!("first"));
        assert_eq!(state.get("value"), Some(&json!("first")));

        let state = apply(&state, "value", json!("second"));
        assert_eq!(state.get("value"), Some(&json!("second")));
    }

    #[test]
    fn test_apply_leaves_original_untouched() {
        let schema = make_schema(vec![("n", FieldType::Number, ReducerType::Sum, Some(json!(0)))]);
        let original = WorkflowState::from_schema(schema);
        let updated = apply(&original, "n", json!(5));

        assert_eq!(original.get("n"), Some(&json!(0)));
        assert_eq!(updated.get("n"), Some(&json!(5)));
    }

    #[test]
    fn test_append_reducer() {
        let schema = make_schema(vec![("items", FieldType::Array, ReducerType::Append, None)]);
        let state = WorkflowState::from_schema(schema);

        let state = apply(&state, "items", json!("item1"));
        assert_eq!(state.get("items"), Some(&json!(["item1"])));

        let state = apply(&state, "items", json!("item2"));
        assert_eq!(state.get("items"), Some(&json!(["item1", "item2"])));

        // Append array
        let state = apply(&state, "items", json!(["item3", "item4"]));
        assert_eq!(
            state.get("items"),
            Some(&json!(["item1", "item2", "item3", "item4"]))
        );
    }

    #[test]
    fn test_sum_reducer_increments() {
        let schema = make_schema(vec![(
            "retries",
            FieldType::Number,
            ReducerType::Sum,
            Some(json!(0)),
        )]);
        let state = WorkflowState::from_schema(schema);

        let state = apply(&state, "retries", json!(1));
        let state = apply(&state, "retries", json!(1));
        assert_eq!(state.get("retries"), Some(&json!(2)));

        let state = apply(&state, "retries", json!(0.5));
        assert_eq!(state.get("retries"), Some(&json!(2.5)));
    }

    #[test]
    fn test_replace_bypasses_reducer() {
        let schema = make_schema(vec![(
            "retries",
            FieldType::Number,
            ReducerType::Sum,
            Some(json!(0)),
        )]);
        let state = WorkflowState::from_schema(schema);
        let state = apply(&state, "retries", json!(2));

        let state = state
            .apply(&StateUpdate::new().replace("retries", json!(0)))
            .unwrap();
        assert_eq!(state.get("retries"), Some(&json!(0)));
    }

    #[test]
    fn test_sum_rejects_non_number() {
        let schema = make_schema(vec![("n", FieldType::Number, ReducerType::Sum, None)]);
        let state = WorkflowState::from_schema(schema);

        let err = state
            .apply(&StateUpdate::new().with("n", json!("one")))
            .unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
    }

    #[test]
    fn test_max_and_min_reducers() {
        let schema = make_schema(vec![
            ("score", FieldType::Number, ReducerType::Max, None),
            ("cost", FieldType::Number, ReducerType::Min, None),
        ]);
        let state = WorkflowState::from_schema(schema);

        let state = apply(&state, "score", json!(5.0));
        let state = apply(&state, "score", json!(3.0)); // Lower, should not update
        assert_eq!(state.get("score"), Some(&json!(5.0)));

        let state = apply(&state, "cost", json!(10.0));
        let state = apply(&state, "cost", json!(15.0)); // Higher, should not update
        let state = apply(&state, "cost", json!(5.0));
        assert_eq!(state.get("cost"), Some(&json!(5.0)));
    }

    #[test]
    fn test_merge_reducer() {
        let schema = make_schema(vec![("scratch", FieldType::Object, ReducerType::Merge, None)]);
        let state = WorkflowState::from_schema(schema);

        let state = apply(&state, "scratch", json!({"a": 1}));
        let state = apply(&state, "scratch", json!({"b": 2}));
        assert_eq!(state.get("scratch"), Some(&json!({"a": 1, "b": 2})));

        let state = apply(&state, "scratch", json!({"a": 10})); // Update key wins
        assert_eq!(state.get("scratch"), Some(&json!({"a": 10, "b": 2})));
    }

    #[test]
    fn test_keep_first_reducer() {
        let schema = make_schema(vec![(
            "started_at",
            FieldType::Number,
            ReducerType::KeepFirst,
            None,
        )]);
        let state = WorkflowState::from_schema(schema);

        let state = apply(&state, "started_at", json!(100));
        let state = apply(&state, "started_at", json!(200));
        assert_eq!(state.get("started_at"), Some(&json!(100)));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let state = WorkflowState::from_schema(Arc::new(StateSchema::default()));

        let err = state
            .apply(&StateUpdate::new().with("unknown", json!("first")))
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownField(ref f) if f == "unknown"));
    }

    #[test]
    fn test_type_mismatch_on_overwrite() {
        let schema = make_schema(vec![("stage", FieldType::String, ReducerType::Overwrite, None)]);
        let state = WorkflowState::from_schema(schema);

        let err = state
            .apply(&StateUpdate::new().with("stage", json!(3)))
            .unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
    }

    #[test]
    fn test_get_path_and_typed_getters() {
        let schema = make_schema(vec![
            ("scratch", FieldType::Object, ReducerType::Merge, None),
            ("step_idx", FieldType::Number, ReducerType::Overwrite, None),
            ("pending", FieldType::Boolean, ReducerType::Overwrite, None),
        ]);
        let state = WorkflowState::from_schema(schema);
        let state = state
            .apply(
                &StateUpdate::new()
                    .with("scratch", json!({"data": {"value": 42}}))
                    .with("step_idx", json!(3))
                    .with("pending", json!(true)),
            )
            .unwrap();

        assert_eq!(state.get_path("scratch.data.value"), Some(&json!(42)));
        assert_eq!(state.get_path("scratch.nonexistent"), None);
        assert_eq!(state.get_u64("step_idx"), 3);
        assert_eq!(state.get_u64("missing"), 0);
        assert_eq!(state.get_bool("pending"), Some(true));

        let decoded: Option<Vec<u32>> = state.get_as("missing").unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let schema = make_schema(vec![
            ("a", FieldType::Number, ReducerType::Sum, Some(json!(1))),
            ("b", FieldType::String, ReducerType::Overwrite, None),
        ]);
        let state = WorkflowState::from_schema(schema.clone());
        let state = apply(&state, "b", json!("hello"));

        let restored = WorkflowState::from_snapshot(schema, &state.to_json()).unwrap();
        assert_eq!(restored, state);
        assert_eq!(serde_json::to_value(&restored).unwrap(), json!({"a": 1, "b": "hello"}));
    }
}
