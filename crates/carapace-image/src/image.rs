//! Image and section data model.

use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use carapace_common::{CarapaceError, CarapaceResult, LockDirection};
use serde::Serialize;

use crate::format::sif::DataType;
use crate::lock::LockRegistry;

/// Name given to the partition holding the root filesystem.
pub const ROOTFS_NAME: &str = "!__rootfs";

bitflags! {
    /// What a partition may be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct Usage: u8 {
        /// Container root filesystem.
        const ROOTFS = 1 << 0;
        /// Overlay upper layer.
        const OVERLAY = 1 << 1;
        /// Data mounted somewhere in the container.
        const DATA = 1 << 2;
    }
}

/// Kind of image, or filesystem type of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Plain directory tree.
    Sandbox,
    /// Container image format with a descriptor table.
    Sif,
    /// Squashfs filesystem.
    Squashfs,
    /// Ext3 filesystem.
    Ext3,
    /// Encrypted squashfs inside a SIF image.
    #[serde(rename = "encryptfs")]
    EncryptedSquashfs,
    /// Raw, unformatted bytes.
    Raw,
}

impl ImageType {
    /// Filesystem type name as understood by mount.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Sif => "sif",
            Self::Squashfs => "squashfs",
            Self::Ext3 => "ext3",
            Self::EncryptedSquashfs => "encryptfs",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a section: a mountable filesystem or an opaque SIF object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    /// Filesystem partition.
    Filesystem(ImageType),
    /// Non-partition SIF data object.
    Object(DataType),
}

/// A named byte range inside an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    /// Section name.
    pub name: String,
    /// Length in bytes.
    pub size: u64,
    /// Start offset in the image file.
    pub offset: u64,
    /// Descriptor ID, zero outside SIF.
    pub id: u32,
    /// Section type.
    #[serde(rename = "type")]
    pub section_type: SectionType,
    /// Allowed usage, empty for non-partition sections.
    pub allowed_usage: Usage,
}

impl Section {
    /// Filesystem type if this section is a partition.
    #[must_use]
    pub const fn fs_type(&self) -> Option<ImageType> {
        match self.section_type {
            SectionType::Filesystem(t) => Some(t),
            SectionType::Object(_) => None,
        }
    }

    /// Whether two sections cover the same byte range.
    #[must_use]
    pub const fn same_range(&self, other: &Self) -> bool {
        self.offset == other.offset && self.size == other.size
    }
}

/// A lock taken on behalf of an image, released when the image is dropped.
#[derive(Debug, Clone)]
pub(crate) struct HeldLock {
    pub(crate) section: Section,
    pub(crate) direction: LockDirection,
}

/// An opened and classified container image.
///
/// Populated once by the detector and never mutated afterwards. Dropping the
/// image closes its file descriptor, which releases its byte-range locks.
#[derive(Debug)]
pub struct Image {
    /// Resolved absolute path.
    pub path: PathBuf,
    /// Base name of the path.
    pub name: String,
    /// `/proc/self/fd/N` reference to the open descriptor.
    pub source: PathBuf,
    /// Detected image type.
    pub image_type: ImageType,
    /// Mountable partitions.
    pub partitions: Vec<Section>,
    /// Opaque data sections, never mounted.
    pub sections: Vec<Section>,
    /// Whether the image is open for writing.
    pub writable: bool,
    /// Union of all partitions' allowed usage.
    pub usage: Usage,
    pub(crate) file: File,
    pub(crate) forced_read_only: bool,
    pub(crate) locks: Option<Arc<LockRegistry>>,
    pub(crate) held: Vec<HeldLock>,
}

impl Image {
    pub(crate) fn new(path: PathBuf, file: File, writable: bool) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            source: PathBuf::new(),
            image_type: ImageType::Raw,
            partitions: Vec::new(),
            sections: Vec::new(),
            writable,
            usage: Usage::empty(),
            file,
            forced_read_only: false,
            locks: None,
            held: Vec::new(),
            path,
        }
    }

    /// The open image file.
    #[must_use]
    pub const fn file(&self) -> &File {
        &self.file
    }

    /// Raw descriptor number backing [`Image::source`].
    #[must_use]
    pub fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Resolved image path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails with [`CarapaceError::ReadOnlyFilesystem`] when write access was
    /// requested but the format is inherently read-only.
    pub fn check_writable(&self) -> CarapaceResult<()> {
        if self.forced_read_only {
            return Err(CarapaceError::ReadOnlyFilesystem {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    /// Whether any partition allows the given usage.
    #[must_use]
    pub const fn has_usage(&self, usage: Usage) -> bool {
        self.usage.intersects(usage)
    }

    /// The root filesystem partition.
    pub fn rootfs_partition(&self) -> CarapaceResult<&Section> {
        self.partitions
            .iter()
            .find(|p| p.allowed_usage.contains(Usage::ROOTFS))
            .ok_or(CarapaceError::PartitionNotFound)
    }

    /// Partitions usable as overlay upper layers.
    pub fn overlay_partitions(&self) -> CarapaceResult<Vec<&Section>> {
        self.partitions_with(Usage::OVERLAY)
    }

    /// Partitions holding data.
    pub fn data_partitions(&self) -> CarapaceResult<Vec<&Section>> {
        self.partitions_with(Usage::DATA)
    }

    /// Look up an opaque section by exact name.
    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn partitions_with(&self, usage: Usage) -> CarapaceResult<Vec<&Section>> {
        let found: Vec<_> = self
            .partitions
            .iter()
            .filter(|p| p.allowed_usage.contains(usage))
            .collect();
        if found.is_empty() {
            return Err(CarapaceError::PartitionNotFound);
        }
        Ok(found)
    }

    pub(crate) fn compute_usage(&mut self) {
        self.usage = self
            .partitions
            .iter()
            .fold(Usage::empty(), |acc, p| acc | p.allowed_usage);
    }
}

impl AsFd for Image {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(registry) = self.locks.take() {
            for held in self.held.drain(..) {
                registry.release(&self.path, &held.section, held.direction);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(name: &str, usage: Usage) -> Section {
        Section {
            name: name.to_string(),
            size: 10,
            offset: 0,
            id: 0,
            section_type: SectionType::Filesystem(ImageType::Ext3),
            allowed_usage: usage,
        }
    }

    fn image_with(partitions: Vec<Section>) -> Image {
        let file = tempfile::tempfile().unwrap();
        let mut img = Image::new(PathBuf::from("/images/test.img"), file, false);
        img.partitions = partitions;
        img.compute_usage();
        img
    }

    #[test]
    fn usage_is_union_of_partitions() {
        let img = image_with(vec![
            partition(ROOTFS_NAME, Usage::ROOTFS),
            partition("data", Usage::DATA),
        ]);
        assert_eq!(img.usage, Usage::ROOTFS | Usage::DATA);
        assert!(img.has_usage(Usage::DATA));
        assert!(!img.has_usage(Usage::OVERLAY));
        assert_eq!(img.name, "test.img");
    }

    #[test]
    fn partition_queries() {
        let img = image_with(vec![
            partition(ROOTFS_NAME, Usage::ROOTFS),
            partition("upper", Usage::OVERLAY),
        ]);
        assert_eq!(img.rootfs_partition().unwrap().name, ROOTFS_NAME);
        assert_eq!(img.overlay_partitions().unwrap().len(), 1);
        assert!(matches!(
            img.data_partitions(),
            Err(CarapaceError::PartitionNotFound)
        ));
    }

    #[test]
    fn forced_read_only_is_reported() {
        let mut img = image_with(Vec::new());
        assert!(img.check_writable().is_ok());
        img.forced_read_only = true;
        assert!(img.check_writable().unwrap_err().is_read_only_filesystem());
    }
}
