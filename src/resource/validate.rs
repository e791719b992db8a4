//! Raw input validation
//!
//! Turns [`RawResource`] declarations into immutable [`Resource`] values.
//! Nothing invalid or partially filled in ever leaves this module.

use super::fingerprint::digest_bytes;
use super::manifest::{RawContainer, RawImage, RawResource, RawStack, RawSwarmNode};
use super::spec::{
    ComposeSource, ContainerSpec, ImageSpec, NodeRole, ResourceSpec, StackSpec, SwarmNodeSpec,
};
use super::{Ensure, Kind, Resource};
use crate::compose::ComposeParser;
use crate::error::{MoorError, Result};
use crate::image::ImageReference;
use std::collections::HashSet;
use std::path::PathBuf;

/// Validate a single raw resource
pub fn validate(raw: &RawResource) -> Result<Resource> {
    let name = raw.name().trim();
    if name.is_empty() {
        return Err(invalid(raw.kind(), name, "name must not be empty"));
    }
    let ensure = match raw.ensure() {
        Some(value) => value
            .parse::<Ensure>()
            .map_err(|e| invalid(raw.kind(), name, &e.to_string()))?,
        None => Ensure::Present,
    };
    if ensure == Ensure::Latest && !matches!(raw.kind(), Kind::Image | Kind::Container) {
        return Err(invalid(
            raw.kind(),
            name,
            "ensure => latest is only supported for images and containers",
        ));
    }

    match raw {
        RawResource::Image(image) => validate_image(name, ensure, image),
        RawResource::Container(container) => validate_container(name, ensure, container),
        RawResource::SwarmNode(node) => validate_swarm_node(name, ensure, node),
        RawResource::Stack(stack) => validate_stack(name, ensure, stack),
    }
}

/// Validate every resource of one pass and enforce per-kind uniqueness
pub fn validate_all(raws: &[RawResource]) -> Result<Vec<Resource>> {
    let mut names = HashSet::new();
    let mut identities = HashSet::new();
    let mut swarm_node: Option<String> = None;
    let mut resources = Vec::with_capacity(raws.len());

    for raw in raws {
        let resource = validate(raw)?;
        if !names.insert((resource.kind(), resource.name().to_string())) {
            return Err(invalid(
                resource.kind(),
                resource.name(),
                "declared more than once",
            ));
        }
        if !identities.insert((resource.kind(), resource.identity().to_string())) {
            return Err(invalid(
                resource.kind(),
                resource.name(),
                &format!("conflicts with another resource managing '{}'", resource.identity()),
            ));
        }
        if resource.kind() == Kind::SwarmNode {
            if let Some(existing) = &swarm_node {
                return Err(invalid(
                    Kind::SwarmNode,
                    resource.name(),
                    &format!("host membership is already declared by '{}'", existing),
                ));
            }
            swarm_node = Some(resource.name().to_string());
        }
        resources.push(resource);
    }

    Ok(resources)
}

fn validate_image(name: &str, ensure: Ensure, raw: &RawImage) -> Result<Resource> {
    let repository = raw.image.as_deref().unwrap_or(name);
    let reference = match raw.tag.as_deref() {
        Some(tag) => format!("{}:{}", repository, tag),
        None => repository.to_string(),
    };
    let reference =
        ImageReference::parse(&reference).map_err(|e| invalid(Kind::Image, name, &e.to_string()))?;
    Resource::new(name, ensure, ResourceSpec::Image(ImageSpec { reference }))
}

fn validate_container(name: &str, ensure: Ensure, raw: &RawContainer) -> Result<Resource> {
    let identity = super::spec::sanitize_container_name(name);
    if !identity.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid(
            Kind::Container,
            name,
            "name must start with a letter or digit",
        ));
    }
    if ensure == Ensure::Absent {
        return Ok(Resource::absent(Kind::Container, name, &identity));
    }

    let image = raw
        .image
        .as_deref()
        .ok_or_else(|| invalid(Kind::Container, name, "parameter 'image' is required"))?;
    let image =
        ImageReference::parse(image).map_err(|e| invalid(Kind::Container, name, &e.to_string()))?;

    for entry in &raw.env {
        if !entry.contains('=') || entry.starts_with('=') {
            return Err(invalid(
                Kind::Container,
                name,
                &format!("env entry '{}' must be KEY=VALUE", entry),
            ));
        }
    }

    let spec = ContainerSpec {
        image,
        command: non_empty(&raw.command),
        restart: non_empty(&raw.restart),
        net: non_empty(&raw.net),
        env: raw.env.clone(),
        ports: raw.ports.clone(),
        volumes: raw.volumes.clone(),
        hostname: non_empty(&raw.hostname),
        extra_parameters: raw.extra_parameters.clone(),
    };
    Resource::new(name, ensure, ResourceSpec::Container(spec))
}

fn validate_swarm_node(name: &str, ensure: Ensure, raw: &RawSwarmNode) -> Result<Resource> {
    if ensure == Ensure::Absent {
        return Ok(Resource::absent(Kind::SwarmNode, name, name));
    }

    let role = match raw.role.as_deref() {
        None if raw.init => NodeRole::Manager,
        None => NodeRole::Worker,
        Some("manager") => NodeRole::Manager,
        Some("worker") => NodeRole::Worker,
        Some(other) => {
            return Err(invalid(
                Kind::SwarmNode,
                name,
                &format!("role must be manager or worker (got '{}')", other),
            ))
        }
    };

    let advertise_addr = non_empty(&raw.advertise_addr);
    let listen_addr = non_empty(&raw.listen_addr);
    let token = non_empty(&raw.token);
    let manager_ip = non_empty(&raw.manager_ip);

    if raw.init {
        if role != NodeRole::Manager {
            return Err(invalid(
                Kind::SwarmNode,
                name,
                "the node initializing a swarm is always a manager",
            ));
        }
        if advertise_addr.is_none() || listen_addr.is_none() {
            return Err(invalid(
                Kind::SwarmNode,
                name,
                "init => true requires advertise_addr and listen_addr",
            ));
        }
    } else if token.is_none() || manager_ip.is_none() {
        return Err(invalid(
            Kind::SwarmNode,
            name,
            "joining a swarm requires token and manager_ip",
        ));
    }

    let spec = SwarmNodeSpec {
        role,
        init: raw.init,
        advertise_addr,
        listen_addr,
        token,
        manager_ip,
    };
    Resource::new(name, ensure, ResourceSpec::SwarmNode(spec))
}

fn validate_stack(name: &str, ensure: Ensure, raw: &RawStack) -> Result<Resource> {
    let valid_name = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric());
    if !valid_name {
        return Err(invalid(
            Kind::Stack,
            name,
            "stack names may only contain letters, digits, '_' and '-'",
        ));
    }
    if ensure == Ensure::Absent {
        return Ok(Resource::absent(Kind::Stack, name, name));
    }
    if raw.compose_files.is_empty() {
        return Err(invalid(
            Kind::Stack,
            name,
            "at least one compose file is required",
        ));
    }

    let mut sources = Vec::with_capacity(raw.compose_files.len());
    let mut documents = Vec::with_capacity(raw.compose_files.len());
    for file in &raw.compose_files {
        let unreadable = |e: std::io::Error| {
            invalid(
                Kind::Stack,
                name,
                &format!("compose file {} cannot be read: {}", file, e),
            )
        };
        // `./a.yml` and `a.yml` are the same deployment
        let path = std::fs::canonicalize(PathBuf::from(file)).map_err(unreadable)?;
        let content = std::fs::read(&path).map_err(unreadable)?;
        let text = String::from_utf8_lossy(&content);
        let document = ComposeParser::parse_str(&text).map_err(|e| {
            invalid(Kind::Stack, name, &format!("{}: {}", path.display(), detail(e)))
        })?;
        documents.push(document);
        sources.push(ComposeSource {
            digest: digest_bytes(&content),
            path,
        });
    }

    // Overlays may be partial on their own, only the merged result has to
    // describe deployable services.
    let merged = documents
        .into_iter()
        .fold(None, |acc, next| match acc {
            None => Some(next),
            Some(base) => Some(ComposeParser::merge_configs(base, next)),
        })
        .unwrap_or_default();
    let warnings = ComposeParser::validate(&merged)
        .map_err(|e| invalid(Kind::Stack, name, &detail(e)))?;
    for warning in warnings {
        tracing::warn!(stack = name, "{}", warning);
    }

    Resource::new(
        name,
        ensure,
        ResourceSpec::Stack(StackSpec {
            compose_files: sources,
        }),
    )
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Message of a validation error without its class prefix
fn detail(e: MoorError) -> String {
    match e {
        MoorError::Validation(message) => message,
        other => other.to_string(),
    }
}

fn invalid(kind: Kind, name: &str, message: &str) -> MoorError {
    MoorError::Validation(format!("{} '{}': {}", kind, name, message))
}
