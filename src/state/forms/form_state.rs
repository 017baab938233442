//! Form state and its transition function

use super::identity::ItemIdentities;
use super::path::{self, FieldPath};
use crate::schema::{Schema, Section};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// In-progress edit state for one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormState {
    /// Top-level fields by name, repeating sections by section id
    pub values: Map<String, Value>,
    /// Messages keyed by field path or, for count rules, by section id
    pub errors: BTreeMap<String, String>,
    pub touched: BTreeMap<String, bool>,
    pub dirty: bool,
    pub is_valid: bool,
    pub is_submitting: bool,
    /// Failure reported by the last submit callback
    pub submit_error: Option<String>,
    #[serde(skip)]
    identities: ItemIdentities,
}

/// Transitions a caller may request through [`reduce`]
#[derive(Debug, Clone, PartialEq)]
pub enum FormMessage {
    /// User edit of a plain or addressed field
    SetValue { path: String, value: Value },
    SetTouched { path: String, touched: bool },
    /// Append an item built from the section's field defaults
    AddItem { section: String },
    RemoveItem { section: String, index: usize },
    /// Start over from new initial values
    Reset { values: Map<String, Value> },
}

/// Every transition the engine applies, including the ones only the
/// validator, the relation synchronizer and submit may produce
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StateUpdate {
    Message(FormMessage),
    SetError { path: String, error: Option<String> },
    /// Replace every validation error at once
    SetErrors(BTreeMap<String, String>),
    /// Display list produced by the relation synchronizer
    ApplyRelationSync { section: String, items: Vec<Value> },
    SetSubmitting(bool),
    SetSubmitError(Option<String>),
}

impl From<FormMessage> for StateUpdate {
    fn from(message: FormMessage) -> Self {
        StateUpdate::Message(message)
    }
}

impl FormState {
    /// Build the initial state for a session.
    ///
    /// Missing top-level fields take their defaults, repeating sections
    /// become lists, and inline items without an identity receive one.
    pub fn new(schema: &Schema, initial_values: Map<String, Value>) -> Self {
        Self::with_identities(schema, initial_values, ItemIdentities::random())
    }

    pub fn with_identities(
        schema: &Schema,
        initial_values: Map<String, Value>,
        mut identities: ItemIdentities,
    ) -> Self {
        let values = prepare_values(schema, initial_values, &mut identities);
        Self {
            values,
            errors: BTreeMap::new(),
            touched: BTreeMap::new(),
            dirty: false,
            is_valid: true,
            is_submitting: false,
            submit_error: None,
            identities,
        }
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        path::get_value(&self.values, &FieldPath::parse(path))
    }

    pub fn error(&self, path: &str) -> Option<&str> {
        self.errors
            .get(&FieldPath::canonical(path))
            .map(String::as_str)
    }

    pub fn is_touched(&self, path: &str) -> bool {
        self.touched
            .get(&FieldPath::canonical(path))
            .copied()
            .unwrap_or(false)
    }

    /// Items of a repeating section, empty when absent
    pub fn items(&self, section_id: &str) -> &[Value] {
        self.values
            .get(section_id)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn item_count(&self, section_id: &str) -> usize {
        self.items(section_id).len()
    }

    fn refresh_validity(&mut self) {
        self.is_valid = self.errors.is_empty();
    }
}

fn prepare_values(
    schema: &Schema,
    mut values: Map<String, Value>,
    identities: &mut ItemIdentities,
) -> Map<String, Value> {
    for section in &schema.sections {
        if !section.is_repeating {
            for field in &section.fields {
                values
                    .entry(field.name.clone())
                    .or_insert_with(|| field.initial_value());
            }
            continue;
        }

        let slot = values
            .entry(section.id.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            tracing::warn!("Initial value of section {} is not a list; ignoring it", section.id);
            *slot = Value::Array(Vec::new());
        }
        if section.is_relation_backed() {
            continue;
        }
        if let Value::Array(items) = slot {
            for item in items.iter_mut() {
                if !item.is_object() {
                    *item = Value::Object(Map::new());
                }
                if let Value::Object(record) = item {
                    path::ensure_identity(record, identities);
                }
            }
        }
    }
    values
}

/// Fresh item for an inline section, populated from field defaults
fn default_item(section: &Section, identities: &mut ItemIdentities) -> Value {
    let mut item = path::new_item(identities);
    for field in &section.fields {
        item.insert(field.name.clone(), field.initial_value());
    }
    Value::Object(item)
}

/// Whether a path writes into a list owned by the item lifecycle: a whole
/// repeating section, or any item of a relation-backed one
fn targets_item_list(schema: &Schema, path: &FieldPath) -> bool {
    match path {
        FieldPath::Plain(name) => schema.section(name).is_some_and(|s| s.is_repeating),
        FieldPath::Item { section, .. } => schema
            .section(section)
            .is_some_and(|s| s.is_relation_backed()),
    }
}

/// Drop keys of a removed item and shift later item keys down by one
fn shift_item_keys<V>(map: &mut BTreeMap<String, V>, section_id: &str, removed: usize) {
    let keys: Vec<String> = map
        .keys()
        .filter(|k| matches!(FieldPath::parse(k).item_location(), Some((s, _)) if s == section_id))
        .cloned()
        .collect();

    let mut moved = Vec::new();
    for key in keys {
        let Some(value) = map.remove(&key) else {
            continue;
        };
        if let FieldPath::Item { index, field, .. } = FieldPath::parse(&key) {
            if index > removed {
                moved.push((FieldPath::item(section_id, index - 1, &field).to_string(), value));
            } else if index < removed {
                moved.push((key, value));
            }
        }
    }
    map.extend(moved);
}

/// Apply one message to a state, producing the next state.
///
/// Never fails: messages that do not fit the schema leave the state as is.
/// Adds beyond a section's `maxItems` are refused here; the check that
/// existing items are valid first needs the predicate registry and lives
/// in the session.
pub fn reduce(schema: &Schema, state: FormState, message: FormMessage) -> FormState {
    apply_update(schema, state, message.into())
}

pub(crate) fn apply_update(schema: &Schema, mut state: FormState, update: StateUpdate) -> FormState {
    let message = match update {
        StateUpdate::Message(message) => message,
        StateUpdate::SetError { path, error } => {
            let key = FieldPath::canonical(&path);
            match error {
                Some(message) => {
                    state.errors.insert(key, message);
                }
                None => {
                    state.errors.remove(&key);
                }
            }
            state.refresh_validity();
            return state;
        }
        StateUpdate::SetErrors(errors) => {
            state.errors = errors;
            state.refresh_validity();
            return state;
        }
        StateUpdate::ApplyRelationSync { section, items } => {
            if !schema.section(&section).is_some_and(|s| s.is_relation_backed()) {
                tracing::warn!("Relation sync ignored: {section} is not relation-backed");
                return state;
            }
            state.values.insert(section, Value::Array(items));
            return state;
        }
        StateUpdate::SetSubmitting(submitting) => {
            state.is_submitting = submitting;
            return state;
        }
        StateUpdate::SetSubmitError(error) => {
            state.submit_error = error;
            return state;
        }
    };

    match message {
        FormMessage::SetValue { path, value } => {
            let parsed = FieldPath::parse(&path);
            if targets_item_list(schema, &parsed) {
                tracing::warn!("Ignoring direct write to item list path {path}");
                return state;
            }
            path::set_value(&mut state.values, &parsed, value, &mut state.identities);
            state.dirty = true;
        }
        FormMessage::SetTouched { path, touched } => {
            state.touched.insert(FieldPath::canonical(&path), touched);
        }
        FormMessage::AddItem { section } => {
            let Some(def) = schema.section(&section).filter(|s| s.is_inline_repeating()) else {
                tracing::warn!("AddItem ignored: {section} is not an inline repeating section");
                return state;
            };
            if def
                .max_items()
                .is_some_and(|max| state.item_count(&section) >= max)
            {
                tracing::debug!("AddItem ignored: {section} is at its item limit");
                return state;
            }
            let item = default_item(def, &mut state.identities);
            let slot = state
                .values
                .entry(section)
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                items.push(item);
            }
            state.dirty = true;
        }
        FormMessage::RemoveItem { section, index } => {
            if !schema.section(&section).is_some_and(|s| s.is_inline_repeating()) {
                tracing::warn!("RemoveItem ignored: {section} is not an inline repeating section");
                return state;
            }
            let Some(Value::Array(items)) = state.values.get_mut(&section) else {
                return state;
            };
            if index >= items.len() {
                tracing::debug!("RemoveItem ignored: {section}[{index}] does not exist");
                return state;
            }
            items.remove(index);
            shift_item_keys(&mut state.errors, &section, index);
            shift_item_keys(&mut state.touched, &section, index);
            state.dirty = true;
            state.refresh_validity();
        }
        FormMessage::Reset { values } => {
            let identities = state.identities;
            state = FormState::with_identities(schema, values, identities);
        }
    }
    state
}
