//! moor - declarative convergence for Docker hosts
//!
//! moor brings a host's image cache, containers, swarm membership and
//! deployed stacks in line with an operator's desired state. Every pass reads
//! the live state, decides on at most one action, performs it and verifies
//! the result, so applying the same input twice changes nothing the second
//! time.
//!
//! - Desired-state model and validation ([`resource`])
//! - Observed state ([`state`])
//! - Diff, execute, verify ([`converge`])
//! - Engine access through the docker CLI or a simulated host ([`engine`])
//! - Manifest runner with detailed exit codes ([`apply`])

pub mod apply;
pub mod compose;
pub mod config;
pub mod converge;
pub mod engine;
pub mod error;
pub mod image;
pub mod resource;
pub mod state;

pub use error::{MoorError, Result};
