//! # runpool-id
//!
//! Runner names and runner types for the runpool autoscaler.
//!
//! ## Design Principles
//!
//! - Names are system-generated and globally unique
//! - A runner's type is recoverable from its name alone, so both the
//!   compute fleet and the CI registry can be filtered without metadata
//! - Names are valid compute instance names (`[a-z][a-z0-9-]{0,62}`)
//!
//! ## Name Format
//!
//! `{prefix}-{uuid}` where the prefix depends on the runner type and the
//! managed environment:
//!
//! - `vm-gcp-prod-6f1c2a4e-0d7b-4f53-9a55-3c8e0b2f91aa` (default runner)
//! - `vm-gcp-ghost-prod-2b9e4d51-7a0c-4c3e-8f11-90d6a4e5c7b2` (ghost runner)

mod error;
mod types;

pub use error::NameError;
pub use types::*;
