//! Form state module

mod forms;
mod notice;

pub use forms::*;
pub(crate) use forms::{apply_update, is_identifier, StateUpdate};
pub use notice::*;
