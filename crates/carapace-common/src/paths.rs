//! Standard filesystem paths for Carapace.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Default directory under which per-container session directories live.
pub static CARAPACE_SESSION_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CARAPACE_SESSION_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/carapace/mnt/session"))
});

/// Kernel binary-format registration directory.
pub static CARAPACE_BINFMT_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CARAPACE_BINFMT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/proc/sys/fs/binfmt_misc"))
});

/// Standard paths used during filesystem assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarapacePaths {
    /// Parent directory of session directories.
    pub session_root: PathBuf,
    /// binfmt_misc mount point consulted for architecture emulation.
    pub binfmt_dir: PathBuf,
}

impl CarapacePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths for an unprivileged user, rooted in the user runtime directory.
    #[must_use]
    pub fn rootless() -> Self {
        let base = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            session_root: base.join("carapace/session"),
            binfmt_dir: CARAPACE_BINFMT_DIR.clone(),
        }
    }

    /// Create paths with a custom session root.
    #[must_use]
    pub fn with_session_root(root: impl Into<PathBuf>) -> Self {
        Self {
            session_root: root.into(),
            ..Self::default()
        }
    }

    /// Session directory for a container instance.
    #[must_use]
    pub fn session(&self, id: &str) -> PathBuf {
        self.session_root.join(id)
    }

    /// Self-referencing path for an open file descriptor.
    #[must_use]
    pub fn proc_self_fd(fd: i32) -> PathBuf {
        Path::new("/proc/self/fd").join(fd.to_string())
    }
}

impl Default for CarapacePaths {
    fn default() -> Self {
        Self {
            session_root: CARAPACE_SESSION_DIR.clone(),
            binfmt_dir: CARAPACE_BINFMT_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_session_root() {
        let paths = CarapacePaths::with_session_root("/tmp/carapace-test");
        assert_eq!(
            paths.session("abc123"),
            PathBuf::from("/tmp/carapace-test/abc123")
        );
    }

    #[test]
    fn proc_self_fd_path() {
        assert_eq!(
            CarapacePaths::proc_self_fd(7),
            PathBuf::from("/proc/self/fd/7")
        );
    }
}
