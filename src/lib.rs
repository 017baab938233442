//! Schema Forms - schema-driven form engine
//!
//! Turns a declarative [`Schema`] into form state with per-field and
//! per-section validation, repeating item groups, and sections whose items
//! are relations to entities kept in an external store.

pub mod config;
pub mod error;
pub mod relations;
pub mod schema;
pub mod session;
pub mod state;
pub mod stores;

pub use config::{EngineConfig, ValidationMode};
pub use error::{EngineError, EngineResult};
pub use schema::{
    AddPolicy, DeletePolicy, Field, FieldType, RelationDescriptor, RepeatingConfig, Schema,
    Section, ValidationRules,
};
pub use session::{
    AddItemOutcome, BatchOutcome, FieldEdit, FormSession, OperationOutcome, SelectionCandidate,
    SubmitOutcome,
};
pub use state::{reduce, FieldPath, FormMessage, FormState, PredicateRegistry};
pub use stores::{MemoryStore, Stores};
