//! Addressed field paths and path-keyed tree updates
//!
//! A path is either a plain field name (`email`) or an item address
//! (`contacts[2].email`). Error and touched maps are keyed by the string
//! form, so a key can always be parsed back into its parts.

use super::identity::ItemIdentities;
use serde_json::{Map, Value};
use std::fmt;

/// Key holding a repeating item's synthetic identity
pub const ITEM_ID_KEY: &str = "_id";

/// A parsed field address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldPath {
    Plain(String),
    Item {
        section: String,
        index: usize,
        field: String,
    },
}

impl FieldPath {
    /// Parse an addressed name. Anything not matching
    /// `<id>[<non-negative integer>].<id>` is a plain name.
    pub fn parse(name: &str) -> Self {
        parse_item(name).unwrap_or_else(|| FieldPath::Plain(name.to_string()))
    }

    /// Normalized key form of a name, e.g. `items[01].sku` becomes `items[1].sku`
    pub fn canonical(name: &str) -> String {
        Self::parse(name).to_string()
    }

    pub fn item(section: &str, index: usize, field: &str) -> Self {
        FieldPath::Item {
            section: section.to_string(),
            index,
            field: field.to_string(),
        }
    }

    /// Name of the addressed field, without section or index
    pub fn field_name(&self) -> &str {
        match self {
            FieldPath::Plain(name) => name,
            FieldPath::Item { field, .. } => field,
        }
    }

    /// Section id and item index for item addresses
    pub fn item_location(&self) -> Option<(&str, usize)> {
        match self {
            FieldPath::Plain(_) => None,
            FieldPath::Item { section, index, .. } => Some((section, *index)),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPath::Plain(name) => f.write_str(name),
            FieldPath::Item {
                section,
                index,
                field,
            } => write!(f, "{section}[{index}].{field}"),
        }
    }
}

impl From<&str> for FieldPath {
    fn from(name: &str) -> Self {
        FieldPath::parse(name)
    }
}

/// Whether a name can be a section id or field name inside an address
pub(crate) fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_item(name: &str) -> Option<FieldPath> {
    let open = name.find('[')?;
    let close = open + name[open..].find(']')?;
    let section = &name[..open];
    let digits = &name[open + 1..close];
    let field = name[close + 1..].strip_prefix('.')?;

    if !is_identifier(section) || !is_identifier(field) {
        return None;
    }
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok()?;

    Some(FieldPath::Item {
        section: section.to_string(),
        index,
        field: field.to_string(),
    })
}

/// Read the value at a path
pub fn get_value<'a>(values: &'a Map<String, Value>, path: &FieldPath) -> Option<&'a Value> {
    match path {
        FieldPath::Plain(name) => values.get(name),
        FieldPath::Item {
            section,
            index,
            field,
        } => values
            .get(section)?
            .as_array()?
            .get(*index)?
            .as_object()?
            .get(field),
    }
}

/// Fresh item record carrying only its identity
pub fn new_item(identities: &mut ItemIdentities) -> Map<String, Value> {
    let mut item = Map::new();
    item.insert(ITEM_ID_KEY.to_string(), Value::String(identities.allocate()));
    item
}

/// Give an item an identity if it has none. Returns true when one was assigned.
pub fn ensure_identity(item: &mut Map<String, Value>, identities: &mut ItemIdentities) -> bool {
    let has_id = matches!(item.get(ITEM_ID_KEY), Some(Value::String(id)) if !id.is_empty());
    if !has_id {
        item.insert(ITEM_ID_KEY.to_string(), Value::String(identities.allocate()));
    }
    !has_id
}

/// Identity of an item record, if it has one
pub fn item_identity(item: &Value) -> Option<&str> {
    item.get(ITEM_ID_KEY)?.as_str()
}

/// Write a value at a path.
///
/// Item writes past the end of the list append identity-only items until
/// the index exists. Only the addressed field of the target item changes.
pub fn set_value(
    values: &mut Map<String, Value>,
    path: &FieldPath,
    value: Value,
    identities: &mut ItemIdentities,
) {
    match path {
        FieldPath::Plain(name) => {
            values.insert(name.clone(), value);
        }
        FieldPath::Item {
            section,
            index,
            field,
        } => {
            let slot = values
                .entry(section.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                tracing::warn!("Replacing non-list value of section {section} with a list");
                *slot = Value::Array(Vec::new());
            }
            let Value::Array(items) = slot else {
                return;
            };

            while items.len() <= *index {
                items.push(Value::Object(new_item(identities)));
            }

            let target = &mut items[*index];
            if !target.is_object() {
                *target = Value::Object(new_item(identities));
            }
            if let Value::Object(record) = target {
                ensure_identity(record, identities);
                record.insert(field.clone(), value);
            }
        }
    }
}
