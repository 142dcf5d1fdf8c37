//! Overlay layer.
//!
//! Mount targets missing from the image are created as placeholders in a
//! lower directory stacked above the root filesystem, so every mount has a
//! target without modifying the image.

use std::path::{Path, PathBuf};

use carapace_common::{CarapaceError, CarapaceResult};

use super::Layer;
use super::session::{FINAL_DIR, Session};
use crate::mount::{MountFlags, Points, Tag};

/// Staged path of the placeholder directory.
pub const LOWER_DIR: &str = "/overlay-lowerdir";

/// Overlay of placeholder directories above the root filesystem.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    lower_dirs: Vec<PathBuf>,
}

impl Layer for Overlay {
    fn add(&mut self, session: &mut Session) -> CarapaceResult<()> {
        session.layout_mut().add_dir(LOWER_DIR)?;
        session.update()?;
        self.lower_dirs.insert(0, PathBuf::from(LOWER_DIR));
        Ok(())
    }

    fn dir(&self) -> &str {
        FINAL_DIR
    }
}

impl Overlay {
    /// New overlay layer, attach it with [`Session::attach_layer`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Staged lower directories, topmost first.
    #[must_use]
    pub fn lower_dirs(&self) -> &[PathBuf] {
        &self.lower_dirs
    }

    /// Stage placeholders for every tagged mount target missing from
    /// `rootfs`, then register the overlay on the session's final path
    /// under [`Tag::Layer`].
    pub fn create_layer(
        &self,
        session: &mut Session,
        rootfs: &Path,
        points: &mut Points,
    ) -> CarapaceResult<()> {
        let lower = self
            .lower_dirs
            .first()
            .ok_or_else(|| CarapaceError::layout("overlay layer is not attached to a session"))?
            .clone();
        let session_path = session.path().to_path_buf();

        for tag in Tag::ALL {
            if tag == Tag::SessionDir {
                continue;
            }
            for point in points.get_by_tag(tag) {
                let dest = Path::new(&point.destination);
                if dest.starts_with(&session_path) {
                    continue;
                }
                let rel = dest.strip_prefix("/").unwrap_or(dest);
                if rel.as_os_str().is_empty() || rootfs.join(rel).exists() {
                    continue;
                }

                let staged = lower.join(rel);
                if session.layout().has(&staged) {
                    continue;
                }

                let (flags, _) = MountFlags::parse_options(&point.options);
                let is_dir = if flags.contains(MountFlags::BIND) {
                    match std::fs::metadata(&point.source) {
                        Ok(meta) => meta.is_dir(),
                        Err(e) => {
                            tracing::warn!(
                                source = %point.source,
                                dest = %point.destination,
                                error = %e,
                                "Skipping placeholder for missing bind source"
                            );
                            continue;
                        }
                    }
                } else {
                    true
                };

                tracing::debug!(dest = %point.destination, is_dir, "Staging mount placeholder");
                if is_dir {
                    session.layout_mut().add_dir(&staged)?;
                } else {
                    session.layout_mut().add_file(&staged, Vec::new())?;
                }
            }
        }
        session.update()?;

        let mut lowerdir = Vec::with_capacity(self.lower_dirs.len() + 1);
        for dir in &self.lower_dirs {
            lowerdir.push(session.get_path(dir)?.display().to_string());
        }
        lowerdir.push(rootfs.display().to_string());

        let final_path = session.final_path()?.display().to_string();
        points.add_overlay(&final_path, MountFlags::NODEV, &lowerdir.join(":"), None, None)?;
        points.tag(&final_path, Tag::Layer)?;

        tracing::info!(target = %final_path, "Overlay layer ready");
        Ok(())
    }
}
