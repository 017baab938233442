//! Relation-backed section support

mod sync;

pub use sync::{
    differs, entity_label, options_to_values, RelationOption, RelationSynchronizer, SyncRequest,
    SyncResult,
};
