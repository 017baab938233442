//! Section and whole-form validation
//!
//! Runs the field validator over every field the schema declares and adds
//! the item-count rules of repeating sections. Relation-backed sections are
//! checked by count only; their items belong to another store.

use super::field::{validate_value, FieldValidation, PredicateRegistry};
use super::form_state::{apply_update, FormState, StateUpdate};
use super::path::{self, FieldPath};
use crate::schema::{Field, Schema, Section};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Owning section and field definition for an addressed path
pub fn field_definition<'a>(
    schema: &'a Schema,
    path: &FieldPath,
) -> Option<(&'a Section, &'a Field)> {
    match path {
        FieldPath::Plain(name) => schema.top_level_field(name),
        FieldPath::Item { section, field, .. } => {
            let section = schema
                .section(section)
                .filter(|s| s.is_inline_repeating())?;
            section.field(field).map(|f| (section, f))
        }
    }
}

/// Validate the value currently stored at a path.
/// `None` when the path names no field of the schema.
pub fn check_field(
    schema: &Schema,
    predicates: &PredicateRegistry,
    values: &Map<String, Value>,
    path: &FieldPath,
) -> Option<FieldValidation> {
    let (_, field) = field_definition(schema, path)?;
    Some(validate_value(
        path::get_value(values, path),
        field,
        predicates,
    ))
}

/// Validate one field and record the outcome under its path
pub fn validate_field(
    schema: &Schema,
    predicates: &PredicateRegistry,
    state: FormState,
    path: &str,
) -> (Option<FieldValidation>, FormState) {
    let parsed = FieldPath::parse(path);
    let Some(result) = check_field(schema, predicates, &state.values, &parsed) else {
        tracing::debug!("validate_field: {path} does not name a schema field");
        return (None, state);
    };
    let state = apply_update(
        schema,
        state,
        StateUpdate::SetError {
            path: parsed.to_string(),
            error: result.error.clone(),
        },
    );
    (Some(result), state)
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Item-count rule for a repeating section.
///
/// For relation-backed sections the lower bound only applies once the
/// parent entity has been persisted; the upper bound always applies.
pub fn section_count_error(section: &Section, count: usize, parent_persisted: bool) -> Option<String> {
    if !section.is_repeating {
        return None;
    }
    let label = section.display_label();
    let enforce_min = !section.is_relation_backed() || parent_persisted;

    if let Some(min) = section.min_items().filter(|_| enforce_min) {
        if count < min {
            return Some(format!("{label} requires at least {min} item{}", plural(min)));
        }
    }
    if let Some(max) = section.max_items() {
        if count > max {
            return Some(format!("{label} allows at most {max} item{}", plural(max)));
        }
    }
    None
}

/// Field failures of one inline item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidItem {
    pub index: usize,
    /// `(path, field label, message)` per failing field
    pub failures: Vec<(String, String, String)>,
}

/// Validate every field of every item of an inline section
pub fn invalid_items(
    schema: &Schema,
    predicates: &PredicateRegistry,
    values: &Map<String, Value>,
    section: &Section,
) -> Vec<InvalidItem> {
    if !section.is_inline_repeating() {
        return Vec::new();
    }
    let count = values
        .get(&section.id)
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    (0..count)
        .filter_map(|index| {
            let failures: Vec<_> = section
                .fields
                .iter()
                .filter_map(|field| {
                    let path = FieldPath::item(&section.id, index, &field.name);
                    let result = check_field(schema, predicates, values, &path)?;
                    let message = result.error?;
                    Some((path.to_string(), field.display_label().to_string(), message))
                })
                .collect();
            (!failures.is_empty()).then_some(InvalidItem { index, failures })
        })
        .collect()
}

/// Aggregate message naming the first few offending items
pub fn add_blocked_message(section: &Section, invalid: &[InvalidItem], limit: usize) -> String {
    let shown: Vec<String> = invalid
        .iter()
        .take(limit.max(1))
        .map(|item| {
            let fields: Vec<&str> = item.failures.iter().map(|(_, l, _)| l.as_str()).collect();
            format!("item {} ({})", item.index + 1, fields.join(", "))
        })
        .collect();

    let mut message = format!(
        "Complete the existing {} entries before adding another: {}",
        section.display_label(),
        shown.join("; ")
    );
    let hidden = invalid.len().saturating_sub(shown.len());
    if hidden > 0 {
        message.push_str(&format!(" and {hidden} more"));
    }
    message
}

/// Every error the form currently has, keyed for addressed display.
///
/// `relation_counts` holds the live count per relation-backed section; a
/// section missing from it falls back to its displayed list.
pub fn collect_errors(
    schema: &Schema,
    predicates: &PredicateRegistry,
    values: &Map<String, Value>,
    parent_persisted: bool,
    relation_counts: &HashMap<String, usize>,
) -> BTreeMap<String, String> {
    let mut errors = BTreeMap::new();

    for section in &schema.sections {
        if !section.is_repeating {
            for field in &section.fields {
                let path = FieldPath::Plain(field.name.clone());
                if let Some(message) = check_field(schema, predicates, values, &path)
                    .and_then(|r| r.error)
                {
                    errors.insert(path.to_string(), message);
                }
            }
            continue;
        }

        let count = if section.is_relation_backed() {
            relation_counts.get(&section.id).copied().unwrap_or_else(|| {
                values
                    .get(&section.id)
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len)
            })
        } else {
            for item in invalid_items(schema, predicates, values, section) {
                for (path, _, message) in item.failures {
                    errors.insert(path, message);
                }
            }
            values
                .get(&section.id)
                .and_then(Value::as_array)
                .map_or(0, Vec::len)
        };

        if let Some(message) = section_count_error(section, count, parent_persisted) {
            errors.insert(section.id.clone(), message);
        }
    }
    errors
}

/// Validate the whole form, replacing all errors
pub fn validate_all(
    schema: &Schema,
    predicates: &PredicateRegistry,
    state: FormState,
    parent_persisted: bool,
    relation_counts: &HashMap<String, usize>,
) -> (bool, FormState) {
    let errors = collect_errors(
        schema,
        predicates,
        &state.values,
        parent_persisted,
        relation_counts,
    );
    let is_valid = errors.is_empty();
    let state = apply_update(schema, state, StateUpdate::SetErrors(errors));
    (is_valid, state)
}

/// A resolved error for summaries such as "first problem on the page"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub path: String,
    pub label: String,
    pub message: String,
}

/// Human label for an error key
pub fn describe_path(schema: &Schema, key: &str) -> String {
    let path = FieldPath::parse(key);
    match &path {
        FieldPath::Plain(name) => {
            if let Some(section) = schema.section(name).filter(|s| s.is_repeating) {
                return section.display_label().to_string();
            }
            schema
                .top_level_field(name)
                .map(|(_, f)| f.display_label().to_string())
                .unwrap_or_else(|| name.clone())
        }
        FieldPath::Item {
            section,
            index,
            field,
        } => {
            let section_label = schema
                .section(section)
                .map_or(section.as_str(), |s| s.display_label());
            let field_label = field_definition(schema, &path)
                .map_or(field.as_str(), |(_, f)| f.display_label());
            format!("{section_label} › Item {} › {field_label}", index + 1)
        }
    }
}

/// First error in schema order
pub fn first_error_summary(schema: &Schema, state: &FormState) -> Option<ErrorSummary> {
    let summary = |key: &str| {
        state.errors.get(key).map(|message| ErrorSummary {
            path: key.to_string(),
            label: describe_path(schema, key),
            message: message.clone(),
        })
    };

    for section in &schema.sections {
        if !section.is_repeating {
            if let Some(found) = section.fields.iter().find_map(|f| summary(&f.name)) {
                return Some(found);
            }
            continue;
        }
        if let Some(found) = summary(&section.id) {
            return Some(found);
        }
        for index in 0..state.item_count(&section.id) {
            let found = section.fields.iter().find_map(|f| {
                summary(&FieldPath::item(&section.id, index, &f.name).to_string())
            });
            if found.is_some() {
                return found;
            }
        }
    }

    // Keys the schema does not know about, in key order
    state.errors.keys().next().and_then(|k| summary(k))
}
