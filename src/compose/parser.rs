//! Docker Compose file parser

use super::config::ComposeConfig;
use crate::error::{MoorError, Result};
use std::path::Path;

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Parse compose file from path
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MoorError::Validation(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| MoorError::Validation(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse multiple compose files, later files overlaying earlier ones
    pub fn parse_files<P: AsRef<Path>>(paths: &[P]) -> Result<ComposeConfig> {
        let mut config: Option<ComposeConfig> = None;

        for path in paths {
            let file_config = Self::parse_file(path.as_ref())?;
            config = Some(match config {
                None => file_config,
                Some(base) => Self::merge_configs(base, file_config),
            });
        }

        Ok(config.unwrap_or_default())
    }

    /// Merge two compose configurations
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            if let Some(existing) = result.services.get_mut(&name) {
                if service.image.is_some() {
                    existing.image = service.image;
                }
                if service.build.is_some() {
                    existing.build = service.build;
                }
                if service.command.is_some() {
                    existing.command = service.command;
                }
                if service.labels.is_some() {
                    existing.labels = service.labels;
                }
                match (&mut existing.deploy, service.deploy) {
                    (Some(current), Some(deploy)) => {
                        if deploy.mode.is_some() {
                            current.mode = deploy.mode;
                        }
                        if deploy.replicas.is_some() {
                            current.replicas = deploy.replicas;
                        }
                        if deploy.labels.is_some() {
                            current.labels = deploy.labels;
                        }
                    }
                    (current @ None, Some(deploy)) => *current = Some(deploy),
                    (_, None) => {}
                }
            } else {
                result.services.insert(name, service);
            }
        }

        result.networks.extend(overlay.networks);
        result.volumes.extend(overlay.volumes);
        result.secrets.extend(overlay.secrets);
        result.configs.extend(overlay.configs);

        result
    }

    /// Validate a merged compose configuration, returning warnings
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.services.is_empty() {
            return Err(MoorError::Validation(
                "compose configuration defines no services".to_string(),
            ));
        }

        for (name, service) in &config.services {
            if service.image.is_none() {
                if service.build.is_none() {
                    return Err(MoorError::Validation(format!(
                        "Service '{}' must have either 'image' or 'build' specified",
                        name
                    )));
                }
                warnings.push(format!(
                    "Service '{}' only has 'build', which stack deploys ignore",
                    name
                ));
            }

            if let Some(deploy) = &service.deploy {
                if deploy.mode.as_deref() == Some("global") && deploy.replicas.is_some() {
                    return Err(MoorError::Validation(format!(
                        "Service '{}' sets 'replicas' in global mode",
                        name
                    )));
                }
            }
        }

        Ok(warnings)
    }
}
