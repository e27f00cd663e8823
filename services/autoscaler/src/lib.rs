//! runpool Autoscaler Library
//!
//! Sizes a pool of self-hosted CI runners. Runner VMs live in a compute
//! fleet; the CI registry knows which of them are online and busy. The
//! autoscaler fuses both views and creates or deletes VMs to keep enough
//! runners free without exceeding the configured maximum.
//!
//! ## Architecture
//!
//! ```text
//! ScaleWorker / RetryScheduler
//! └── ScalePolicy               (decisions, serialized by a ScaleLease)
//!     ├── RunnerInventory       (fused fleet + registry view)
//!     └── FleetExecutor         (create/delete runners)
//!         ├── Fleet             (ComputeClient, MockFleet)
//!         └── RunnerRegistry    (RegistryClient, MockRegistry)
//! ```
//!
//! ## Modules
//!
//! - `auth`: Access and identity tokens for the remote APIs
//! - `compute`: Compute Engine implementation of [`fleet::Fleet`]
//! - `registry`: CI registry client and types
//! - `inventory`: Fused runner listings
//! - `executor`: Runner creation and deletion
//! - `policy`: Scale decisions
//! - `retry`: Re-check loop for job-triggered scale-ups
//! - `worker`: Periodic scale loop

pub mod auth;
pub mod compute;
pub mod config;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod inventory;
pub mod lease;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use executor::{BatchOutcome, FleetExecutor};
pub use fleet::MockFleet;
pub use inventory::{Runner, RunnerInventory};
pub use policy::{Decision, PolicyConfig, ScalePolicy, ScaleUpState, ScaleUpTask};
pub use registry::MockRegistry;
