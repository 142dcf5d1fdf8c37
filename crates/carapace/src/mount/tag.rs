//! Mount point tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classification of mount destinations, in assembly order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    /// Session directory.
    SessionDir,
    /// Container root filesystem.
    RootFs,
    /// Layers mounted before the overlay.
    PreLayer,
    /// Overlay or underlay combining the root filesystem.
    Layer,
    /// Image overlay partitions and directories.
    Overlay,
    /// User and system bind mounts.
    Binds,
    /// Kernel filesystems such as proc and sysfs.
    Kernel,
    /// Host filesystems.
    HostFs,
    /// Current working directory.
    Cwd,
    /// Generated files such as passwd and hosts.
    Files,
    /// Binds requested by the user.
    UserBinds,
    /// Temporary directories.
    Tmp,
    /// Scratch directories.
    Scratch,
    /// Home directory.
    Home,
    /// Device tree.
    Dev,
    /// Mounts applied last.
    Final,
}

impl Tag {
    /// Every tag in assembly order.
    pub const ALL: [Self; 16] = [
        Self::SessionDir,
        Self::RootFs,
        Self::PreLayer,
        Self::Layer,
        Self::Overlay,
        Self::Binds,
        Self::Kernel,
        Self::HostFs,
        Self::Cwd,
        Self::Files,
        Self::UserBinds,
        Self::Tmp,
        Self::Scratch,
        Self::Home,
        Self::Dev,
        Self::Final,
    ];

    /// Tag name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionDir => "sessiondir",
            Self::RootFs => "rootfs",
            Self::PreLayer => "prelayer",
            Self::Layer => "layer",
            Self::Overlay => "overlay",
            Self::Binds => "binds",
            Self::Kernel => "kernel",
            Self::HostFs => "hostfs",
            Self::Cwd => "cwd",
            Self::Files => "files",
            Self::UserBinds => "userbinds",
            Self::Tmp => "tmp",
            Self::Scratch => "scratch",
            Self::Home => "home",
            Self::Dev => "dev",
            Self::Final => "final",
        }
    }

    /// Whether several destinations may carry this tag.
    #[must_use]
    pub const fn is_multi(self) -> bool {
        !matches!(
            self,
            Self::SessionDir | Self::RootFs | Self::Layer | Self::Cwd | Self::Home
        )
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag name that is not in [`Tag::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mount tag {0:?}")]
pub struct UnknownTag(pub String);

impl FromStr for Tag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTag(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for tag in Tag::ALL {
            assert_eq!(tag.as_str().parse::<Tag>().unwrap(), tag);
        }
        assert!("nope".parse::<Tag>().is_err());
    }

    #[test]
    fn order_follows_assembly() {
        let mut sorted = Tag::ALL;
        sorted.sort();
        assert_eq!(sorted, Tag::ALL);
        assert!(!Tag::RootFs.is_multi());
        assert!(Tag::Binds.is_multi());
    }
}
