//! Docker Compose documents for stack resources
//!
//! Stacks are deployed from one or more compose files; this module parses,
//! merges and sanity-checks them before anything reaches the engine.

pub mod config;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use parser::ComposeParser;
