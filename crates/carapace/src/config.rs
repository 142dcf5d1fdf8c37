//! Assembly configuration.

use std::path::{Path, PathBuf};

use carapace_common::{CarapaceError, CarapacePaths, CarapaceResult};
use carapace_image::{Detector, PartitionPolicy};
use serde::{Deserialize, Serialize};

use crate::mount::{MountPolicy, Points};

/// Settings for image detection and mount planning, read from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Standard paths.
    pub paths: CarapacePaths,
    /// Mount validation rules.
    #[serde(flatten)]
    pub mounts: MountPolicy,
    /// Handling of corrupt SIF data and overlay partitions.
    pub overlay_partition_policy: PartitionPolicy,
}

impl AssemblyConfig {
    /// Configuration for an unprivileged user.
    #[must_use]
    pub fn rootless() -> Self {
        Self {
            paths: CarapacePaths::rootless(),
            ..Self::default()
        }
    }

    /// Default configuration file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("carapace/config.toml")
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> CarapaceResult<Self> {
        toml::from_str(text).map_err(|e| CarapaceError::Config {
            message: e.to_string(),
        })
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> CarapaceResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CarapaceError::Config {
            message: format!("can't read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Set the session root.
    #[must_use]
    pub fn with_session_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths.session_root = root.into();
        self
    }

    /// Set the security context appended to mounts.
    #[must_use]
    pub fn with_security_context(mut self, context: impl Into<String>) -> Self {
        self.mounts.security_context = Some(context.into());
        self
    }

    /// Set the corrupt partition handling.
    #[must_use]
    pub const fn with_partition_policy(mut self, policy: PartitionPolicy) -> Self {
        self.overlay_partition_policy = policy;
        self
    }

    /// Image detector following this configuration.
    #[must_use]
    pub fn detector(&self) -> Detector {
        Detector::new(&self.paths).with_partition_policy(self.overlay_partition_policy)
    }

    /// Empty mount registry following this configuration.
    #[must_use]
    pub fn points(&self) -> Points {
        Points::with_policy(self.mounts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AssemblyConfig::default();
        assert_eq!(config.overlay_partition_policy, PartitionPolicy::Reject);
        assert!(config.mounts.context_exempt_fs.contains("tmpfs"));
        assert!(config.mounts.security_context.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = AssemblyConfig::default()
            .with_session_root("/run/carapace")
            .with_security_context("system_u:object_r:container_file_t:s0")
            .with_partition_policy(PartitionPolicy::Drop);
        assert_eq!(config.paths.session_root, PathBuf::from("/run/carapace"));
        assert_eq!(config.overlay_partition_policy, PartitionPolicy::Drop);
        assert!(config.points().policy().security_context.is_some());
    }

    #[test]
    fn parses_toml() {
        let config = AssemblyConfig::from_toml(
            r#"
            security_context = "unconfined_u:object_r:user_tmp_t:s0"
            context_exempt_fs = ["tmpfs", "overlay"]
            overlay_partition_policy = "drop"

            [paths]
            session_root = "/tmp/sessions"
            "#,
        )
        .unwrap();
        assert!(config.mounts.context_exempt_fs.contains("overlay"));
        assert!(config.mounts.kernel_fs_types.contains("proc"));
        assert_eq!(config.overlay_partition_policy, PartitionPolicy::Drop);
        assert_eq!(config.paths.session_root, PathBuf::from("/tmp/sessions"));
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = AssemblyConfig::from_toml("overlay_partition_policy = 3").unwrap_err();
        assert!(matches!(err, CarapaceError::Config { .. }));
    }
}
