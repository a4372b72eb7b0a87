//! Courier: acknowledges platform interactions within their hard deadline and
//! delivers follow-ups under the platform's rate limits.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;
