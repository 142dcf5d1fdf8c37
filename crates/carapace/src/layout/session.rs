//! Per-container session directory.

use std::path::{Path, PathBuf};

use carapace_common::CarapaceResult;

use super::Layer;
use super::manager::Manager;

/// Staged path of the root filesystem mount point.
pub const ROOTFS_DIR: &str = "/rootfs";
/// Staged path of the assembled container view.
pub const FINAL_DIR: &str = "/final";

/// A session directory holding the root filesystem mount point, the final
/// view and any layer staging area.
#[derive(Debug)]
pub struct Session {
    layout: Manager,
    layer_dir: Option<PathBuf>,
}

impl Session {
    /// Create the session tree under `path`, creating `path` if needed.
    pub fn new(path: impl Into<PathBuf>) -> CarapaceResult<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;

        let mut layout = Manager::new(path)?;
        layout.add_dir(ROOTFS_DIR)?;
        layout.add_dir(FINAL_DIR)?;
        layout.create()?;

        tracing::debug!(path = %layout.root().display(), "Created session directory");
        Ok(Self {
            layout,
            layer_dir: None,
        })
    }

    /// Session directory on the host.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    /// Staged layout of the session.
    #[must_use]
    pub const fn layout(&self) -> &Manager {
        &self.layout
    }

    /// Mutable staged layout of the session.
    pub const fn layout_mut(&mut self) -> &mut Manager {
        &mut self.layout
    }

    /// Host path of a staged entry.
    pub fn get_path(&self, path: impl AsRef<Path>) -> CarapaceResult<PathBuf> {
        self.layout.get_path(path)
    }

    /// Write newly staged entries.
    pub fn update(&mut self) -> CarapaceResult<usize> {
        self.layout.update()
    }

    /// Host path the root filesystem is mounted on.
    pub fn rootfs_path(&self) -> CarapaceResult<PathBuf> {
        self.layout.get_path(ROOTFS_DIR)
    }

    /// Host path of the container's final view: the layer's directory when
    /// a layer is attached, else the root filesystem.
    pub fn final_path(&self) -> CarapaceResult<PathBuf> {
        match &self.layer_dir {
            Some(dir) => self.layout.get_path(dir),
            None => self.rootfs_path(),
        }
    }

    /// Attach a layer, letting it stage what it needs.
    pub fn attach_layer(&mut self, layer: &mut impl Layer) -> CarapaceResult<()> {
        layer.add(self)?;
        self.layer_dir = Some(PathBuf::from(layer.dir()));
        Ok(())
    }

    /// Whether a layer is attached.
    #[must_use]
    pub const fn has_layer(&self) -> bool {
        self.layer_dir.is_some()
    }
}
