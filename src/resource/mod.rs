//! Desired-state model
//!
//! A [`Resource`] is the validated, immutable description of what the
//! operator wants for one resource instance. It is rebuilt from raw input on
//! every convergence pass and never mutated afterwards.

pub mod fingerprint;
pub mod manifest;
pub mod spec;
pub mod validate;

pub use fingerprint::Fingerprint;
pub use manifest::{Manifest, RawResource};
pub use spec::{ComposeSource, ContainerSpec, ImageSpec, NodeRole, ResourceSpec, StackSpec, SwarmNodeSpec};
pub use validate::{validate, validate_all};

use crate::error::{MoorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Image,
    Container,
    SwarmNode,
    Stack,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Image => "image",
            Kind::Container => "container",
            Kind::SwarmNode => "swarm_node",
            Kind::Stack => "stack",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = MoorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(Kind::Image),
            "container" => Ok(Kind::Container),
            "swarm_node" | "swarm" => Ok(Kind::SwarmNode),
            "stack" => Ok(Kind::Stack),
            other => Err(MoorError::Validation(format!(
                "unknown resource kind '{}' (expected image, container, swarm_node or stack)",
                other
            ))),
        }
    }
}

/// Desired lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
    Latest,
}

impl fmt::Display for Ensure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ensure::Present => write!(f, "present"),
            Ensure::Absent => write!(f, "absent"),
            Ensure::Latest => write!(f, "latest"),
        }
    }
}

impl FromStr for Ensure {
    type Err = MoorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "present" => Ok(Ensure::Present),
            "absent" => Ok(Ensure::Absent),
            "latest" => Ok(Ensure::Latest),
            other => Err(MoorError::Validation(format!(
                "ensure must be one of present, absent, latest (got '{}')",
                other
            ))),
        }
    }
}

/// Kind-qualified resource name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: Kind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// A validated desired-state resource.
///
/// `spec` and `fingerprint` are present exactly when `ensure` is not
/// [`Ensure::Absent`]; an absent resource only carries its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    name: String,
    kind: Kind,
    ensure: Ensure,
    identity: String,
    spec: Option<ResourceSpec>,
    fingerprint: Option<Fingerprint>,
}

impl Resource {
    /// Build a present or latest resource from its parameters
    pub fn new(name: &str, ensure: Ensure, spec: ResourceSpec) -> Result<Self> {
        let kind = spec.kind();
        let identity = spec.identity(name);
        if ensure == Ensure::Absent {
            return Ok(Self::absent(kind, name, &identity));
        }
        let fingerprint = spec.fingerprint()?;
        Ok(Self {
            name: name.to_string(),
            kind,
            ensure,
            identity,
            spec: Some(spec),
            fingerprint: Some(fingerprint),
        })
    }

    /// Build an absent resource. `identity` is the name the engine knows it by.
    pub fn absent(kind: Kind, name: &str, identity: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            ensure: Ensure::Absent,
            identity: identity.to_string(),
            spec: None,
            fingerprint: None,
        }
    }

    /// The same resource with `ensure => absent`
    pub fn to_absent(&self) -> Self {
        Self::absent(self.kind, &self.name, &self.identity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn ensure(&self) -> Ensure {
        self.ensure
    }

    /// Name of the live object on the engine (sanitized container name,
    /// normalized image reference, stack name)
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn spec(&self) -> Option<&ResourceSpec> {
        self.spec.as_ref()
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// Operator-facing reference
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind, &self.name)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' (ensure {})", self.kind, self.name, self.ensure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageReference;

    fn busybox() -> ResourceSpec {
        ResourceSpec::Image(ImageSpec {
            reference: ImageReference::parse("busybox").unwrap(),
        })
    }

    #[test]
    fn test_ensure_parse() {
        assert_eq!("latest".parse::<Ensure>().unwrap(), Ensure::Latest);
        assert!(matches!(
            "running".parse::<Ensure>(),
            Err(MoorError::Validation(_))
        ));
    }

    #[test]
    fn test_kind_parse_accepts_swarm_alias() {
        assert_eq!("swarm".parse::<Kind>().unwrap(), Kind::SwarmNode);
        assert!("volume".parse::<Kind>().is_err());
    }

    #[test]
    fn test_absent_drops_parameters() {
        let resource = Resource::new("busybox", Ensure::Absent, busybox()).unwrap();
        assert!(resource.spec().is_none());
        assert!(resource.fingerprint().is_none());
        assert_eq!(resource.identity(), "docker.io/library/busybox:latest");
    }

    #[test]
    fn test_to_absent_keeps_identity() {
        let resource = Resource::new("busybox", Ensure::Present, busybox()).unwrap();
        let absent = resource.to_absent();
        assert_eq!(absent.ensure(), Ensure::Absent);
        assert_eq!(absent.identity(), resource.identity());
        assert_eq!(absent.reference(), resource.reference());
    }

    #[test]
    fn test_reference_display() {
        let r = ResourceRef::new(Kind::Stack, "web");
        assert_eq!(r.to_string(), "stack 'web'");
    }
}
