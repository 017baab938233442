//! Trait abstraction for the external stores the engine consumes
//!
//! The engine never persists anything itself; entities, relation records
//! and schemas are owned by these collaborators.

use crate::schema::Schema;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A stored entity of some schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub schema_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A link between a source entity and a target entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub id: String,
    pub source_schema_id: String,
    pub source_entity_id: String,
    pub target_schema_id: String,
    pub target_entity_id: String,
    pub relation_type_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Identifies the relation list of one parent under one relation type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationKey {
    pub source_schema_id: String,
    pub source_entity_id: String,
    pub relation_type_id: String,
    pub target_schema_id: String,
}

impl Relation {
    pub fn matches(&self, key: &RelationKey) -> bool {
        self.source_schema_id == key.source_schema_id
            && self.source_entity_id == key.source_entity_id
            && self.relation_type_id == key.relation_type_id
            && self.target_schema_id == key.target_schema_id
    }
}

/// Relation record operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// List relations of a parent under one relation type
    async fn list(&self, key: &RelationKey) -> Result<Vec<Relation>>;

    /// Link the parent to a target entity
    async fn create(&self, key: &RelationKey, target_entity_id: &str) -> Result<Relation>;

    /// Delete a relation record
    async fn delete(&self, relation_id: &str) -> Result<()>;
}

/// Entity operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, schema_id: &str, id: &str) -> Result<Entity>;

    /// List entities of a schema, used by selection flows
    async fn list(&self, schema_id: &str) -> Result<Vec<Entity>>;

    async fn create(&self, schema_id: &str, data: Map<String, Value>) -> Result<Entity>;

    async fn update(&self, schema_id: &str, id: &str, data: Map<String, Value>) -> Result<Entity>;

    async fn delete(&self, schema_id: &str, id: &str) -> Result<()>;
}

/// Schema lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn get(&self, schema_id: &str) -> Result<Schema>;
}

/// The collaborators one session talks to
#[derive(Clone)]
pub struct Stores {
    pub relations: Arc<dyn RelationStore>,
    pub entities: Arc<dyn EntityStore>,
    pub schemas: Arc<dyn SchemaStore>,
}

impl Stores {
    pub fn new(
        relations: Arc<dyn RelationStore>,
        entities: Arc<dyn EntityStore>,
        schemas: Arc<dyn SchemaStore>,
    ) -> Self {
        Self {
            relations,
            entities,
            schemas,
        }
    }

    /// All three roles served by one implementation
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: RelationStore + EntityStore + SchemaStore + 'static,
    {
        Self {
            relations: store.clone(),
            entities: store.clone(),
            schemas: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
