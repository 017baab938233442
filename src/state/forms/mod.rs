//! Form domain layer
//!
//! Path resolution, field validation, the form state machine and the
//! section/form validator. Everything in here is synchronous and pure.

mod field;
mod form_state;
mod identity;
mod path;
mod validator;

pub use field::{is_absent, validate_value, FieldValidation, Predicate, PredicateRegistry};
pub use form_state::{reduce, FormMessage, FormState};
pub(crate) use form_state::{apply_update, StateUpdate};
pub use identity::ItemIdentities;
pub use path::{ensure_identity, get_value, item_identity, set_value, FieldPath, ITEM_ID_KEY};
pub(crate) use path::is_identifier;
pub use validator::{
    add_blocked_message, check_field, collect_errors, describe_path, field_definition,
    first_error_summary, invalid_items, section_count_error, validate_all, validate_field,
    ErrorSummary, InvalidItem,
};
