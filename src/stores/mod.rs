//! External store interfaces and implementations

mod memory;
mod traits;

pub use memory::MemoryStore;
pub use traits::{Entity, EntityStore, Relation, RelationKey, RelationStore, SchemaStore, Stores};

#[cfg(test)]
pub use traits::{MockEntityStore, MockRelationStore, MockSchemaStore};
