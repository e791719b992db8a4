//! Registry client for upstream manifest digests
//!
//! `ensure => latest` needs to know whether the registry holds a newer
//! manifest than the local cache. The client resolves a tag to its
//! `Docker-Content-Digest` with a `HEAD` request, performing the anonymous
//! bearer token exchange when the registry asks for it.

use super::reference::{ImageReference, DEFAULT_REGISTRY};
use crate::error::{MoorError, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Manifest media types accepted when resolving a digest
pub mod media_types {
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
}

/// Source of upstream manifest digests
#[async_trait]
pub trait UpstreamDigests: Send + Sync {
    /// Current digest of `reference` in its registry, `None` if the registry
    /// does not know the tag
    async fn upstream_digest(&self, reference: &ImageReference) -> Result<Option<String>>;
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Endpoint serving `docker.io` references
    pub docker_hub_url: String,
    /// Use plain HTTP for registries other than Docker Hub
    pub insecure: bool,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            docker_hub_url: "https://registry-1.docker.io".to_string(),
            insecure: false,
            timeout_secs: 30,
        }
    }
}

/// Registry client resolving manifest digests
pub struct Registry {
    /// Registry configuration
    config: RegistryConfig,
    /// HTTP client
    client: reqwest::Client,
}

impl Registry {
    /// Create a new registry client
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MoorError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Base URL of the registry serving `reference`
    fn base_url(&self, reference: &ImageReference) -> String {
        if reference.registry() == DEFAULT_REGISTRY {
            self.config.docker_hub_url.trim_end_matches('/').to_string()
        } else if self.config.insecure {
            format!("http://{}", reference.registry())
        } else {
            format!("https://{}", reference.registry())
        }
    }

    async fn head_manifest(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let accept = [
            media_types::OCI_INDEX,
            media_types::MANIFEST_LIST_V2,
            media_types::OCI_MANIFEST,
            media_types::MANIFEST_V2,
        ]
        .join(", ");

        let mut request = self.client.head(url).header("Accept", accept);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        request
            .send()
            .await
            .map_err(|e| MoorError::Unavailable(format!("registry request failed: {}", e)))
    }

    /// Fetch an anonymous pull token for the challenge in `WWW-Authenticate`
    async fn fetch_token(&self, challenge: &Challenge) -> Result<String> {
        let mut request = self.client.get(&challenge.realm);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = &challenge.scope {
            request = request.query(&[("scope", scope)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MoorError::Unavailable(format!("token request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(MoorError::Unavailable(format!(
                "token request failed: {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| MoorError::Unavailable(format!("malformed token response: {}", e)))?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| MoorError::Unavailable("token response carried no token".to_string()))
    }
}

#[async_trait]
impl UpstreamDigests for Registry {
    async fn upstream_digest(&self, reference: &ImageReference) -> Result<Option<String>> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository(),
            reference.manifest_reference()
        );

        let mut response = self.head_manifest(&url, None).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .and_then(Challenge::parse)
                .ok_or_else(|| {
                    MoorError::Unavailable(format!(
                        "registry {} requires authentication",
                        reference.registry()
                    ))
                })?;
            let challenge = challenge.with_default_scope(reference);
            let token = self.fetch_token(&challenge).await?;
            response = self.head_manifest(&url, Some(&token)).await?;
        }

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(response
                .headers()
                .get("Docker-Content-Digest")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)),
            status => Err(MoorError::Unavailable(format!(
                "manifest lookup for {} failed: {}",
                reference, status
            ))),
        }
    }
}

/// Token response from auth server
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, Clone, PartialEq)]
struct Challenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        static PARAM: OnceLock<Regex> = OnceLock::new();
        let params = header.strip_prefix("Bearer ")?;
        let re = PARAM.get_or_init(|| {
            Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge pattern is valid")
        });

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for caps in re.captures_iter(params) {
            let value = caps[2].to_string();
            match &caps[1] {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }

    fn with_default_scope(mut self, reference: &ImageReference) -> Self {
        if self.scope.is_none() {
            self.scope = Some(format!("repository:{}:pull", reference.repository()));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_config_default() {
        let config = RegistryConfig::default();
        assert!(config.docker_hub_url.contains("docker.io"));
        assert!(!config.insecure);
    }

    #[test]
    fn test_base_url() {
        let registry = Registry::new(RegistryConfig::default()).unwrap();
        let hub = ImageReference::parse("busybox").unwrap();
        assert_eq!(registry.base_url(&hub), "https://registry-1.docker.io");

        let private = ImageReference::parse("registry.example.com:5000/app").unwrap();
        assert_eq!(
            registry.base_url(&private),
            "https://registry.example.com:5000"
        );
    }

    #[test]
    fn test_parse_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/busybox:pull""#;
        let challenge = Challenge::parse(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/busybox:pull")
        );
    }

    #[test]
    fn test_challenge_default_scope() {
        let challenge = Challenge::parse(r#"Bearer realm="https://r.example/token""#).unwrap();
        let reference = ImageReference::parse("registry.example.com/team/app:1").unwrap();
        let challenge = challenge.with_default_scope(&reference);
        assert_eq!(challenge.scope.as_deref(), Some("repository:team/app:pull"));
    }

    #[test]
    fn test_basic_challenge_is_not_bearer() {
        assert!(Challenge::parse(r#"Basic realm="registry""#).is_none());
    }
}
