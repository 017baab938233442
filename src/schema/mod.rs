//! Schema model
//!
//! Declarative description of an entity's editable sections and fields.
//! Supplied by an external schema store and immutable for one session.

mod model;

pub use model::{
    AddPolicy, DeletePolicy, Field, FieldType, RelationDescriptor, RepeatingConfig, Schema,
    Section, ValidationRules,
};
