//! Image references and upstream registry lookups

pub mod reference;
pub mod registry;

pub use reference::ImageReference;
pub use registry::{Registry, RegistryConfig, UpstreamDigests};
