//! Image reference parsing and normalization

use crate::error::{MoorError, Result};
use serde::{Serialize, Serializer};
use std::fmt;

/// Maximum length of an image reference in bytes
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Characters allowed in an image reference
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

/// Registry used for references without an explicit registry host
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// A normalized image reference, e.g. `docker.io/library/busybox:latest`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize a reference. `busybox` becomes
    /// `docker.io/library/busybox:latest`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty image reference"));
        }
        if reference.len() > MAX_IMAGE_REF_LEN {
            let head: String = reference.chars().take(50).collect();
            return Err(invalid(
                &format!("{}...", head),
                &format!("exceeds maximum length of {} bytes", MAX_IMAGE_REF_LEN),
            ));
        }
        if let Some(c) = reference.chars().find(|c| !IMAGE_REF_VALID_CHARS.contains(*c)) {
            return Err(invalid(reference, &format!("invalid character '{}'", c)));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.starts_with("sha256:") || digest.len() <= "sha256:".len() {
                    return Err(invalid(reference, "digest must be sha256:<hex>"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &name[split + 1..];
                if tag.is_empty() {
                    return Err(invalid(reference, "empty tag"));
                }
                (&name[..split], Some(tag.to_string()))
            }
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid(reference, "empty repository path component"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid(reference, "repository names must be lowercase"));
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };
        let tag = match (&tag, &digest) {
            (None, None) => Some("latest".to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The tag or digest the registry resolves
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    /// `registry/repository` without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether a local repo digest (`name@sha256:...`) matches `digest`
    pub fn has_repo_digest(&self, repo_digests: &[String], digest: &str) -> bool {
        repo_digests.iter().any(|entry| {
            entry
                .rsplit_once('@')
                .map(|(_, d)| d == digest)
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl Serialize for ImageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn invalid(reference: &str, reason: &str) -> MoorError {
    MoorError::Validation(format!("invalid image reference '{}': {}", reference, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_official_images() {
        let r = ImageReference::parse("busybox").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/busybox:latest");
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/busybox");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_equivalent_spellings_are_equal() {
        let a = ImageReference::parse("busybox").unwrap();
        let b = ImageReference::parse("docker.io/library/busybox:latest").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_registry_with_port() {
        let r = ImageReference::parse("registry.example.com:5000/team/app:1.2").unwrap();
        assert_eq!(r.registry(), "registry.example.com:5000");
        assert_eq!(r.repository(), "team/app");
        assert_eq!(r.tag(), Some("1.2"));
    }

    #[test]
    fn test_user_repository_on_hub() {
        let r = ImageReference::parse("winamd64/hello-seattle").unwrap();
        assert_eq!(r.to_string(), "docker.io/winamd64/hello-seattle:latest");
    }

    #[test]
    fn test_digest_reference_has_no_default_tag() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = ImageReference::parse(&format!("alpine@{}", digest)).unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(r.manifest_reference(), digest);
    }

    #[test]
    fn test_rejects_invalid_references() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("busy box").is_err());
        assert!(ImageReference::parse("Busybox").is_err());
        assert!(ImageReference::parse("busybox:").is_err());
        assert!(ImageReference::parse(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[test]
    fn test_has_repo_digest() {
        let r = ImageReference::parse("busybox").unwrap();
        let digests = vec!["docker.io/library/busybox@sha256:abc".to_string()];
        assert!(r.has_repo_digest(&digests, "sha256:abc"));
        assert!(!r.has_repo_digest(&digests, "sha256:def"));
    }
}
