//! Mount planning.
//!
//! [`Points`] collects and validates the mounts a container needs. The
//! result is handed to a privileged executor as a [`MountPlan`].

pub mod apply;
pub mod flags;
pub mod points;
pub mod tag;

use carapace_common::CarapaceResult;
use serde::{Deserialize, Serialize};

pub use apply::apply;
pub use flags::MountFlags;
pub use points::{MountPolicy, Points};
pub use tag::Tag;

/// One mount, with flags spelled as option strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Mount source: a path, an image file or a filesystem name.
    pub source: String,
    /// Absolute mount target.
    pub destination: String,
    /// Filesystem type, empty for binds and remounts.
    #[serde(rename = "type", default)]
    pub fs_type: String,
    /// Flag names followed by filesystem options.
    #[serde(default)]
    pub options: Vec<String>,
}

/// A mount point with the tag it was registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMount {
    /// Tag, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    /// The mount.
    #[serde(flatten)]
    pub point: MountPoint,
}

/// Ordered mount list handed to the mount executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPlan {
    /// Mounts in execution order.
    pub mounts: Vec<PlannedMount>,
}

impl MountPlan {
    /// Encode as pretty-printed JSON.
    pub fn to_json(&self) -> CarapaceResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> CarapaceResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_json_shape() {
        let mut points = Points::new();
        points.add_fs("/proc", "proc", MountFlags::NOSUID, &[]).unwrap();
        points.tag("/proc", Tag::Kernel).unwrap();

        let json = points.plan().to_json().unwrap();
        insta::assert_snapshot!(json, @r#"
        {
          "mounts": [
            {
              "tag": "kernel",
              "source": "proc",
              "destination": "/proc",
              "type": "proc",
              "options": [
                "nosuid"
              ]
            }
          ]
        }
        "#);
        assert_eq!(MountPlan::from_json(&json).unwrap(), points.plan());
    }
}
