//! Image format detection.

use std::io;
use std::path::Path;
use std::sync::Arc;

use carapace_common::{CarapaceError, CarapacePaths, CarapaceResult};
use rustix::fs::Access;
use rustix::io::FdFlags;

use crate::arch::ArchOracle;
use crate::format::{DetectContext, Format, Initialized, PartitionPolicy};
use crate::image::Image;
use crate::lock::LockRegistry;

/// Opens images and classifies them by trying each format in turn.
#[derive(Debug, Clone)]
pub struct Detector {
    formats: Vec<Format>,
    locks: Arc<LockRegistry>,
    ctx: DetectContext,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(&CarapacePaths::default())
    }
}

impl Detector {
    /// Detector trying every format, with the process-wide lock registry.
    #[must_use]
    pub fn new(paths: &CarapacePaths) -> Self {
        Self {
            formats: Format::DEFAULT_ORDER.to_vec(),
            locks: LockRegistry::global(),
            ctx: DetectContext {
                arch: ArchOracle::new(&paths.binfmt_dir),
                partition_policy: PartitionPolicy::default(),
            },
        }
    }

    /// Use a specific lock registry.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// Use a specific architecture oracle.
    #[must_use]
    pub fn with_arch(mut self, arch: ArchOracle) -> Self {
        self.ctx.arch = arch;
        self
    }

    /// Set the handling of corrupt SIF data and overlay partitions.
    #[must_use]
    pub const fn with_partition_policy(mut self, policy: PartitionPolicy) -> Self {
        self.ctx.partition_policy = policy;
        self
    }

    /// Restrict detection to some formats, tried in the given order.
    #[must_use]
    pub fn with_formats(mut self, formats: impl IntoIterator<Item = Format>) -> Self {
        self.formats = formats.into_iter().collect();
        self
    }

    /// Lock registry used for detected images.
    #[must_use]
    pub const fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Open and classify the image at `path`.
    ///
    /// A squashfs image requested writable is returned read-only; call
    /// [`Image::check_writable`] to find out.
    pub fn init(&self, path: impl AsRef<Path>, writable: bool) -> CarapaceResult<Image> {
        let path = std::fs::canonicalize(path.as_ref())?;

        let mut writable = writable;
        if writable && rustix::fs::access(&path, Access::WRITE_OK).is_err() {
            tracing::debug!(path = %path.display(), "No write permission, opening read-only");
            writable = false;
        }

        for &format in &self.formats {
            let file = match format.open_mode(writable).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::IsADirectory => {
                    tracing::debug!(path = %path.display(), format = format.name(), "Skipping format for directory");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let meta = file.metadata()?;

            let mut image = Image::new(path.clone(), file, writable);
            let outcome = match format.initialize(&mut image, &meta, &self.ctx) {
                Ok(outcome) => outcome,
                Err(e) if e.is_format_mismatch() => {
                    tracing::debug!(path = %path.display(), error = %e, "Format did not match");
                    continue;
                }
                Err(e) => return Err(e),
            };

            image.compute_usage();
            rustix::io::fcntl_setfd(&image.file, FdFlags::CLOEXEC).map_err(io::Error::from)?;
            image.source = CarapacePaths::proc_self_fd(image.fd());
            image.forced_read_only = outcome == Initialized::ReadOnly;

            format.lock(&mut image, &self.locks)?;

            tracing::debug!(
                path = %image.path.display(),
                image_type = %image.image_type,
                writable = image.writable,
                partitions = image.partitions.len(),
                "Image detected"
            );
            return Ok(image);
        }

        Err(CarapaceError::UnknownFormat { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageType, ROOTFS_NAME};
    use crate::testutil::{ext3_image, squashfs_image, write_image};

    fn detector() -> Detector {
        Detector::default().with_locks(Arc::new(LockRegistry::new()))
    }

    #[test]
    fn directory_is_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let img = detector().init(dir.path(), false).unwrap();
        assert_eq!(img.image_type, ImageType::Sandbox);
        assert_eq!(img.partitions[0].name, ROOTFS_NAME);
        assert!(img.source.starts_with("/proc/self/fd"));
    }

    #[test]
    fn symlink_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_image(dir.path(), "rootfs.ext3", &ext3_image(64 * 1024));
        let link = dir.path().join("link.img");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let img = detector().init(&link, false).unwrap();
        assert_eq!(img.path, std::fs::canonicalize(&target).unwrap());
        assert_eq!(img.name, "rootfs.ext3");
    }

    #[test]
    fn unknown_bytes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "junk", &[0u8; 4096]);
        let err = detector().init(&path, false).unwrap_err();
        assert!(matches!(err, CarapaceError::UnknownFormat { .. }));
    }

    #[test]
    fn restricted_formats_skip_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "fs.sqfs", &squashfs_image(4096, 1));
        let err = detector()
            .with_formats([Format::Ext3])
            .init(&path, false)
            .unwrap_err();
        assert!(matches!(err, CarapaceError::UnknownFormat { .. }));
    }
}
