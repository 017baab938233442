//! In-memory store implementation
//!
//! Serves all three store roles from one process-local map. Used by the
//! command-line front end and by integration tests.

use super::traits::{Entity, EntityStore, Relation, RelationKey, RelationStore, SchemaStore};
use crate::schema::Schema;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    schemas: HashMap<String, Schema>,
    entities: HashMap<(String, String), Entity>,
    relations: Vec<Relation>,
}

/// Process-local entity, relation and schema store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.inner
            .get_mut()
            .schemas
            .insert(schema.id.clone(), schema);
        self
    }

    /// Seed an entity with a known id
    pub fn with_entity(mut self, schema_id: &str, id: &str, data: Value) -> Self {
        let entity = Entity {
            id: id.to_string(),
            schema_id: schema_id.to_string(),
            data: data.as_object().cloned().unwrap_or_default(),
            updated_at: Some(Utc::now()),
        };
        self.inner
            .get_mut()
            .entities
            .insert((schema_id.to_string(), id.to_string()), entity);
        self
    }

    /// Seed a relation record
    pub fn with_relation(mut self, key: &RelationKey, target_entity_id: &str) -> Self {
        let relation = new_relation(key, target_entity_id);
        self.inner.get_mut().relations.push(relation);
        self
    }

    pub async fn relation_count(&self) -> usize {
        self.inner.read().await.relations.len()
    }

    pub async fn contains_entity(&self, schema_id: &str, id: &str) -> bool {
        self.inner
            .read()
            .await
            .entities
            .contains_key(&(schema_id.to_string(), id.to_string()))
    }
}

fn new_relation(key: &RelationKey, target_entity_id: &str) -> Relation {
    Relation {
        id: uuid::Uuid::new_v4().to_string(),
        source_schema_id: key.source_schema_id.clone(),
        source_entity_id: key.source_entity_id.clone(),
        target_schema_id: key.target_schema_id.clone(),
        target_entity_id: target_entity_id.to_string(),
        relation_type_id: key.relation_type_id.clone(),
        created_at: Some(Utc::now()),
    }
}

#[async_trait]
impl RelationStore for MemoryStore {
    async fn list(&self, key: &RelationKey) -> Result<Vec<Relation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .relations
            .iter()
            .filter(|r| r.matches(key))
            .cloned()
            .collect())
    }

    async fn create(&self, key: &RelationKey, target_entity_id: &str) -> Result<Relation> {
        let relation = new_relation(key, target_entity_id);
        self.inner.write().await.relations.push(relation.clone());
        Ok(relation)
    }

    async fn delete(&self, relation_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let before = inner.relations.len();
        inner.relations.retain(|r| r.id != relation_id);
        if inner.relations.len() == before {
            return Err(anyhow!("Relation {relation_id} not found"));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, schema_id: &str, id: &str) -> Result<Entity> {
        self.inner
            .read()
            .await
            .entities
            .get(&(schema_id.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("Entity {schema_id}/{id} not found"))
    }

    async fn list(&self, schema_id: &str) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        let mut entities: Vec<Entity> = inner
            .entities
            .values()
            .filter(|e| e.schema_id == schema_id)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    async fn create(&self, schema_id: &str, data: Map<String, Value>) -> Result<Entity> {
        let entity = Entity {
            id: uuid::Uuid::new_v4().to_string(),
            schema_id: schema_id.to_string(),
            data,
            updated_at: Some(Utc::now()),
        };
        self.inner.write().await.entities.insert(
            (schema_id.to_string(), entity.id.clone()),
            entity.clone(),
        );
        Ok(entity)
    }

    async fn update(&self, schema_id: &str, id: &str, data: Map<String, Value>) -> Result<Entity> {
        let mut inner = self.inner.write().await;
        let entity = inner
            .entities
            .get_mut(&(schema_id.to_string(), id.to_string()))
            .ok_or_else(|| anyhow!("Entity {schema_id}/{id} not found"))?;
        entity.data = data;
        entity.updated_at = Some(Utc::now());
        Ok(entity.clone())
    }

    async fn delete(&self, schema_id: &str, id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .entities
            .remove(&(schema_id.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| anyhow!("Entity {schema_id}/{id} not found"))
    }
}

#[async_trait]
impl SchemaStore for MemoryStore {
    async fn get(&self, schema_id: &str) -> Result<Schema> {
        self.inner
            .read()
            .await
            .schemas
            .get(schema_id)
            .cloned()
            .ok_or_else(|| anyhow!("Schema {schema_id} not found"))
    }
}
