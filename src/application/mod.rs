//! Application services: the interaction coordinator and its collaborators.

pub mod buckets;
pub mod builtin;
pub mod context;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod failures;
pub mod handlers;
pub mod idempotency;
pub mod maintenance;
pub mod repos;
pub mod retry;
pub mod tokens;
pub mod transport;
