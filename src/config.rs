//! Engine configuration
//!
//! Read from `--config` or `<config dir>/moor/config.yaml`; every field has a
//! default, so a missing file is not an error.

use crate::converge::RetryPolicy;
use crate::engine::DockerConfig;
use crate::error::{MoorError, Result};
use crate::image::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file name
pub const CONFIG_FILE: &str = "config.yaml";

/// moor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MoorConfig {
    pub docker: DockerConfig,
    pub retry: RetryPolicy,
    /// Extra substrings marking engine failures as transient
    pub transient_patterns: Vec<String>,
    pub registry: RegistryConfig,
}

impl MoorConfig {
    /// Default location, `None` when the platform has no config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("moor").join(CONFIG_FILE))
    }

    /// Load `path`, or the default location if `path` is `None`. An explicit
    /// path must exist; the default one may not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_path(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MoorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| MoorError::Config(format!("{}: {}", path.display(), e)))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values no engine could work with
    pub fn check(&self) -> Result<()> {
        if self.docker.binary.trim().is_empty() {
            return Err(MoorError::Config("docker.binary must not be empty".to_string()));
        }
        if self.docker.timeout_secs == 0 {
            return Err(MoorError::Config(
                "docker.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MoorError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(MoorError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-attempt engine timeout
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.timeout_secs)
    }

    /// Worst-case duration of one pass
    pub fn pass_budget(&self) -> Duration {
        self.retry.budget(self.attempt_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MoorConfig::default();
        assert_eq!(config.docker.binary, "docker");
        assert!(config.docker.host.is_none());
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "docker:\n  host: tcp://10.0.0.1:2376\nretry:\n  max_attempts: 2\ntransient_patterns:\n  - too many requests"
        )
        .unwrap();

        let config = MoorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.docker.host.as_deref(), Some("tcp://10.0.0.1:2376"));
        assert_eq!(config.docker.binary, "docker");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(config.transient_patterns, vec!["too many requests"]);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dockr:\n  host: x").unwrap();
        assert!(matches!(
            MoorConfig::load(Some(file.path())),
            Err(MoorError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_retry() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retry:\n  max_attempts: 0").unwrap();
        assert!(MoorConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = MoorConfig::load(Some(Path::new("/nonexistent/moor.yaml")));
        assert!(matches!(result, Err(MoorError::Config(_))));
    }
}
