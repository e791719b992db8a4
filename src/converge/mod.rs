//! The convergence engine: diff, execute, verify

pub mod action;
pub mod controller;
pub mod differ;
pub mod executor;
pub mod retry;

pub use action::Action;
pub use controller::{Controller, Outcome, PassReport, PassState};
pub use differ::diff;
pub use executor::{Execution, ExecutionFailure, Executor};
pub use retry::RetryPolicy;
