//! Domain layer types and invariants.

pub mod error;
pub mod tokens;
pub mod types;
