//! Configuration fingerprints
//!
//! A fingerprint is the SHA-256 digest of the canonical JSON form of a
//! resource's effective configuration. Struct fields serialize in
//! declaration order and sequences keep their order, so equal parameters
//! always produce equal fingerprints.

use super::{Kind, NodeRole};
use crate::error::Result;
use crate::image::ImageReference;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Label carrying the fingerprint on containers and stack services
pub const FINGERPRINT_LABEL: &str = "io.moor.fingerprint";

/// Deterministic digest of a resource's effective configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint any serializable value
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let canonical = serde_json::to_vec(value)?;
        Ok(Self(digest_bytes(&canonical)))
    }

    /// Accept a fingerprint read back from a label. Anything that is not a
    /// well-formed sha256 digest is treated as no fingerprint at all.
    pub fn parse(value: &str) -> Option<Self> {
        let hex = value.strip_prefix("sha256:")?;
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `sha256:<hex>` digest of raw bytes
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Fingerprint of a locally present image
pub fn image(reference: &ImageReference) -> Result<Fingerprint> {
    Fingerprint::of(&(Kind::Image, reference))
}

/// Fingerprint of a swarm membership. `advertise_host` and `manager_host`
/// are only part of the identity when the desired state pins them to IP
/// addresses; `manager_host` is the manager a node joins through.
pub fn membership(
    role: NodeRole,
    advertise_host: Option<&str>,
    manager_host: Option<&str>,
) -> Result<Fingerprint> {
    #[derive(Serialize)]
    struct Membership<'a> {
        kind: Kind,
        role: NodeRole,
        advertise_host: Option<&'a str>,
        manager_host: Option<&'a str>,
    }

    Fingerprint::of(&Membership {
        kind: Kind::SwarmNode,
        role,
        advertise_host,
        manager_host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_bytes_known_value() {
        assert_eq!(
            digest_bytes(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_of_is_deterministic() {
        let a = Fingerprint::of(&vec!["a.yml", "b.yml"]).unwrap();
        let b = Fingerprint::of(&vec!["a.yml", "b.yml"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_of_is_order_sensitive() {
        let ab = Fingerprint::of(&vec!["a.yml", "b.yml"]).unwrap();
        let ba = Fingerprint::of(&vec!["b.yml", "a.yml"]).unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_parse_label_value() {
        let fp = Fingerprint::of("x").unwrap();
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp));
        assert_eq!(Fingerprint::parse("sha256:nothex"), None);
        assert_eq!(Fingerprint::parse("handmade"), None);
    }

    #[test]
    fn test_membership_host_is_optional() {
        let pinned = membership(NodeRole::Manager, Some("10.0.0.5"), None).unwrap();
        let loose = membership(NodeRole::Manager, None, None).unwrap();
        assert_ne!(pinned, loose);
        assert_ne!(loose, membership(NodeRole::Worker, None, None).unwrap());
    }

    #[test]
    fn test_membership_covers_join_target() {
        let a = membership(NodeRole::Worker, None, Some("10.0.0.1")).unwrap();
        let b = membership(NodeRole::Worker, None, Some("10.9.9.9")).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, membership(NodeRole::Worker, None, None).unwrap());
    }
}
