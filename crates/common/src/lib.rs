//! Shared types for the view-sync backend: identifiers, versions, row
//! values, the query AST, and tunable knobs.

pub mod env;
pub mod knobs;
pub mod query;
pub mod sha256;
pub mod types;
pub mod value;
