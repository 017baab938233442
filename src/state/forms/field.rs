//! Field-level validation
//!
//! A pure mapping from a value and a field definition to a verdict. Rules
//! run in a fixed order and the first failing rule's message wins.

use crate::schema::Field;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A named custom rule
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Custom predicates a schema may reference by name
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Predicate>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, predicate: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(predicate));
    }

    pub fn with<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.register(name, predicate);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Predicate> {
        self.predicates.get(name)
    }
}

impl fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("PredicateRegistry")
            .field("predicates", &names)
            .finish()
    }
}

/// Outcome of validating one value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidation {
    pub is_valid: bool,
    pub error: Option<String>,
}

impl FieldValidation {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
        }
    }

    pub fn invalid(message: String) -> Self {
        Self {
            is_valid: false,
            error: Some(message),
        }
    }
}

/// Missing, null and empty strings all count as absent
pub fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Validate a value against a field's rules.
///
/// Order: required, minLength/min, maxLength/max, pattern, custom.
/// An absent optional value is valid without consulting further rules.
pub fn validate_value(
    value: Option<&Value>,
    field: &Field,
    predicates: &PredicateRegistry,
) -> FieldValidation {
    let rules = &field.validation_rules;
    let label = field.display_label();
    let fail = |generated: String| {
        FieldValidation::invalid(rules.message.clone().unwrap_or(generated))
    };

    if is_absent(value) {
        if field.required {
            return fail(format!("{label} is required"));
        }
        return FieldValidation::valid();
    }
    let Some(value) = value else {
        return FieldValidation::valid();
    };

    if let (Some(min), Some(len)) = (rules.min_length, length_of(value)) {
        if len < min {
            return fail(format!("{label} must be at least {min} characters"));
        }
    }
    if let (Some(min), Some(n)) = (rules.min, number_of(value)) {
        if n < min {
            return fail(format!("{label} must be at least {min}"));
        }
    }

    if let (Some(max), Some(len)) = (rules.max_length, length_of(value)) {
        if len > max {
            return fail(format!("{label} must be at most {max} characters"));
        }
    }
    if let (Some(max), Some(n)) = (rules.max, number_of(value)) {
        if n > max {
            return fail(format!("{label} must be at most {max}"));
        }
    }

    if let (Some(pattern), Some(text)) = (rules.pattern.as_deref(), text_of(value)) {
        let matches = regex::Regex::new(pattern)
            .map(|re| re.is_match(&text))
            .unwrap_or(false);
        if !matches {
            return fail(format!("{label} has an invalid format"));
        }
    }

    if let Some(name) = rules.custom.as_deref() {
        match predicates.get(name) {
            Some(predicate) => {
                if !predicate(value) {
                    return fail(format!("{label} is invalid"));
                }
            }
            None => {
                tracing::warn!("Field {} references unknown predicate {name}", field.name);
                return fail(format!("{label} uses unknown rule '{name}'"));
            }
        }
    }

    FieldValidation::valid()
}
