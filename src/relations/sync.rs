//! Relation synchronization
//!
//! Fetches the relation records of one parent, resolves each target entity
//! and turns the survivors into a display list. Fetching never touches form
//! state; the session applies a [`SyncResult`] as a single transition.

use crate::schema::Schema;
use crate::stores::{Entity, Relation, RelationKey, Stores};
use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields tried, in order, when a schema declares no title field
const FALLBACK_TITLE_FIELDS: [&str; 4] = ["name", "title", "label", "id"];

/// One displayed entry of a relation-backed section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationOption {
    /// Target entity id
    pub id: String,
    pub label: String,
    /// Relation record linking the parent to this entity
    pub relation_id: String,
}

/// A fetch to run for one section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub section_id: String,
    pub key: RelationKey,
    /// Issue order of this request within the session
    pub generation: u64,
}

/// Outcome of a successful fetch
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub section_id: String,
    pub generation: u64,
    /// Every relation record, including ones whose target failed to load
    pub relations: Vec<Relation>,
    pub options: Vec<RelationOption>,
}

impl SyncResult {
    /// Live relation count, used by item-count rules
    pub fn live_count(&self) -> usize {
        self.relations.len()
    }

    /// Display list in the shape stored in the value tree
    pub fn to_values(&self) -> Vec<Value> {
        options_to_values(&self.options)
    }
}

pub fn options_to_values(options: &[RelationOption]) -> Vec<Value> {
    options
        .iter()
        .filter_map(|o| serde_json::to_value(o).ok())
        .collect()
}

/// Whether writing `next` would change the stored value.
/// Compares serialized forms.
pub fn differs(current: Option<&Value>, next: &[Value]) -> bool {
    let current = match current {
        Some(value) => serde_json::to_string(value).ok(),
        None => None,
    };
    let next = serde_json::to_string(next).ok();
    current != next
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Display label of an entity.
///
/// Uses the schema's title field when there is one, then the generic
/// fallbacks, then the entity id.
pub fn entity_label(entity: &Entity, schema: Option<&Schema>) -> String {
    let title = schema.and_then(Schema::title_field_name);
    title
        .into_iter()
        .chain(FALLBACK_TITLE_FIELDS)
        .find_map(|field| entity.data.get(field).and_then(scalar_text))
        .unwrap_or_else(|| entity.id.clone())
}

/// Runs relation fetches against the stores
#[derive(Debug, Clone)]
pub struct RelationSynchronizer {
    stores: Stores,
}

impl RelationSynchronizer {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Current number of relation records for a key
    pub async fn count(&self, key: &RelationKey) -> Result<usize> {
        Ok(self.stores.relations.list(key).await?.len())
    }

    /// Fetch relations and their targets.
    ///
    /// Target lookups run concurrently; failed lookups are dropped from the
    /// display list. Only the relation listing itself can fail the fetch.
    pub async fn fetch(&self, request: SyncRequest) -> Result<SyncResult> {
        let key = &request.key;
        let relations = self.stores.relations.list(key).await?;

        let target_schema = match self.stores.schemas.get(&key.target_schema_id).await {
            Ok(schema) => Some(schema),
            Err(e) => {
                tracing::debug!(
                    "Schema {} unavailable, using fallback labels: {e}",
                    key.target_schema_id
                );
                None
            }
        };

        let lookups = relations.iter().map(|r| {
            self.stores
                .entities
                .get(&r.target_schema_id, &r.target_entity_id)
        });
        let entities = join_all(lookups).await;

        let options = relations
            .iter()
            .zip(entities)
            .filter_map(|(relation, entity)| match entity {
                Ok(entity) => Some(RelationOption {
                    id: entity.id.clone(),
                    label: entity_label(&entity, target_schema.as_ref()),
                    relation_id: relation.id.clone(),
                }),
                Err(e) => {
                    tracing::warn!(
                        "Dropping relation {}: target {} failed to load: {e}",
                        relation.id,
                        relation.target_entity_id
                    );
                    None
                }
            })
            .collect();

        Ok(SyncResult {
            section_id: request.section_id,
            generation: request.generation,
            relations,
            options,
        })
    }
}
