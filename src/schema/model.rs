//! Schema, section and field definitions

use crate::error::{EngineError, EngineResult};
use crate::state::is_identifier;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Widget kind of a field. Only affects the value a field starts with when
/// the schema declares no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Textarea,
    Email,
    Number,
    Date,
    Select,
    Multiselect,
    Checkbox,
}

/// Declarative validation rules for a single field.
///
/// The set is closed; `required` lives on [`Field`] itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationRules {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Name of a predicate registered with the engine
    pub custom: Option<String>,
    /// Message used instead of the generated one for any failing rule
    pub message: Option<String>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self.min_length.is_none()
            && self.max_length.is_none()
            && self.pattern.is_none()
            && self.min.is_none()
            && self.max.is_none()
            && self.custom.is_none()
    }
}

/// A single editable field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "ValidationRules::is_empty")]
    pub validation_rules: ValidationRules,
    #[serde(default)]
    pub default_value: Option<Value>,
    /// Marks the field used as the display title of an entity
    #[serde(default)]
    pub is_title: bool,
}

impl Field {
    /// Create a plain optional text field
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            field_type: FieldType::Text,
            required: false,
            validation_rules: ValidationRules::default(),
            default_value: None,
            is_title: false,
        }
    }

    /// Mark the field as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Attach a human label
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Replace the validation rules
    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = rules;
        self
    }

    /// Set the declared default value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Value a fresh record starts with for this field
    pub fn initial_value(&self) -> Value {
        if let Some(value) = &self.default_value {
            return value.clone();
        }
        match self.field_type {
            FieldType::Number => Value::Null,
            FieldType::Checkbox => Value::Bool(false),
            FieldType::Multiselect => Value::Array(Vec::new()),
            _ => Value::String(String::new()),
        }
    }
}

/// What the user may do when adding to a relation-backed section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddPolicy {
    /// Only newly created target entities may be linked
    AddOnly,
    /// New entities or existing ones may be linked
    #[default]
    CanSelectExisting,
    /// Only existing entities may be linked
    MustSelectExisting,
}

impl AddPolicy {
    pub fn allows_selection(&self) -> bool {
        !matches!(self, Self::AddOnly)
    }
}

/// What removal from a relation-backed section deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletePolicy {
    /// Delete the relation record and the target entity
    ItemAndRelation,
    /// Delete only the relation record
    #[default]
    RelationOnly,
}

/// Links a repeating section to entities kept in an external store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDescriptor {
    pub target_schema_id: String,
    pub relation_type_id: String,
    #[serde(default)]
    pub add_policy: AddPolicy,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub min_items: Option<usize>,
    #[serde(default)]
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeatingConfig {
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub relation: Option<RelationDescriptor>,
}

/// A group of fields, optionally repeating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub is_repeating: bool,
    #[serde(default)]
    pub repeating_config: Option<RepeatingConfig>,
}

impl Section {
    /// Create a non-repeating section
    pub fn single(id: &str, fields: Vec<Field>) -> Self {
        Self {
            id: id.to_string(),
            label: None,
            fields,
            is_repeating: false,
            repeating_config: None,
        }
    }

    /// Create a repeating section with inline item fields
    pub fn repeating(id: &str, fields: Vec<Field>, config: RepeatingConfig) -> Self {
        Self {
            id: id.to_string(),
            label: None,
            fields,
            is_repeating: true,
            repeating_config: Some(config),
        }
    }

    /// Create a repeating section whose items are linked entities
    pub fn related(id: &str, relation: RelationDescriptor) -> Self {
        Self {
            id: id.to_string(),
            label: None,
            fields: Vec::new(),
            is_repeating: true,
            repeating_config: Some(RepeatingConfig {
                relation: Some(relation),
                ..Default::default()
            }),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self) -> Option<&RelationDescriptor> {
        if !self.is_repeating {
            return None;
        }
        self.repeating_config.as_ref()?.relation.as_ref()
    }

    pub fn is_relation_backed(&self) -> bool {
        self.relation().is_some()
    }

    /// Repeating with items stored inline in the value tree
    pub fn is_inline_repeating(&self) -> bool {
        self.is_repeating && !self.is_relation_backed()
    }

    /// Lower item-count bound; the relation's bound takes precedence
    pub fn min_items(&self) -> Option<usize> {
        let config = self.repeating_config.as_ref()?;
        config
            .relation
            .as_ref()
            .and_then(|r| r.min_items)
            .or(config.min_items)
    }

    /// Upper item-count bound; the relation's bound takes precedence
    pub fn max_items(&self) -> Option<usize> {
        let config = self.repeating_config.as_ref()?;
        config
            .relation
            .as_ref()
            .and_then(|r| r.max_items)
            .or(config.max_items)
    }
}

/// A complete form description for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Field whose value names an entity of this schema
    #[serde(default)]
    pub title_field: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Schema {
    pub fn new(id: &str, sections: Vec<Section>) -> Self {
        Self {
            id: id.to_string(),
            label: None,
            title_field: None,
            sections,
        }
    }

    /// Parse a schema document and run the structural checks
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let schema: Schema = serde_json::from_str(json)?;
        schema.check()?;
        Ok(schema)
    }

    /// Reject documents the engine cannot address unambiguously
    pub fn check(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidSchema("schema id is empty".to_string()));
        }

        let mut section_ids = HashSet::new();
        for section in &self.sections {
            if !section_ids.insert(section.id.as_str()) {
                return Err(EngineError::DuplicateSection(section.id.clone()));
            }
            if section.is_repeating && !is_identifier(&section.id) {
                return Err(EngineError::InvalidIdentifier(section.id.clone()));
            }
            if section.is_repeating && section.fields.is_empty() && !section.is_relation_backed() {
                return Err(EngineError::EmptyRepeatingSection(section.id.clone()));
            }

            let mut names = HashSet::new();
            for field in &section.fields {
                if !is_identifier(&field.name) {
                    return Err(EngineError::InvalidIdentifier(field.name.clone()));
                }
                if !names.insert(field.name.as_str()) {
                    return Err(EngineError::DuplicateField {
                        section: section.id.clone(),
                        field: field.name.clone(),
                    });
                }
                if let Some(pattern) = &field.validation_rules.pattern {
                    regex::Regex::new(pattern).map_err(|source| EngineError::InvalidPattern {
                        field: field.name.clone(),
                        source,
                    })?;
                }
            }
        }

        // Top-level field names and repeating section ids share one key space
        let mut top_level = HashSet::new();
        let keys = self.sections.iter().flat_map(|s| {
            if s.is_repeating {
                vec![s.id.as_str()]
            } else {
                s.fields.iter().map(|f| f.name.as_str()).collect()
            }
        });
        for key in keys {
            if !top_level.insert(key) {
                return Err(EngineError::InvalidSchema(format!(
                    "value key '{key}' is used more than once"
                )));
            }
        }
        Ok(())
    }

    pub fn section(&self, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    /// Find a field of a non-repeating section by its top-level name
    pub fn top_level_field(&self, name: &str) -> Option<(&Section, &Field)> {
        self.sections
            .iter()
            .filter(|s| !s.is_repeating)
            .find_map(|s| s.field(name).map(|f| (s, f)))
    }

    /// Name of the field that titles entities of this schema
    pub fn title_field_name(&self) -> Option<&str> {
        if let Some(name) = self.title_field.as_deref() {
            return Some(name);
        }
        self.sections
            .iter()
            .flat_map(|s| s.fields.iter())
            .find(|f| f.is_title)
            .map(|f| f.name.as_str())
    }

    pub fn relation_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.is_relation_backed())
    }
}
