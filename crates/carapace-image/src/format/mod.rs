//! Image formats.
//!
//! Each variant of [`Format`] knows how to open, recognize and lock one kind
//! of image. The detector tries them in [`Format::DEFAULT_ORDER`].

pub mod ext3;
pub mod sandbox;
pub mod sif;
pub mod squashfs;

use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use carapace_common::{CarapaceError, CarapaceResult};
use serde::{Deserialize, Serialize};

use crate::arch::ArchOracle;
use crate::image::Image;
use crate::lock::LockRegistry;

/// Number of bytes read from the front of an image to recognize it.
pub const HEADER_BUFFER_SIZE: usize = 2048;

/// Marker of a self-executing stub placed before the filesystem.
pub const LAUNCH_STRING: &[u8] = b" run-singularity";

/// Offset at which a filesystem starts once a launch stub is skipped.
#[must_use]
pub fn launch_offset(buf: &[u8]) -> u64 {
    buf.windows(LAUNCH_STRING.len())
        .position(|w| w == LAUNCH_STRING)
        .map_or(0, |pos| (pos + LAUNCH_STRING.len() + 1) as u64)
}

/// Outcome of a superblock check, before it is tied to an image path.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// The bytes do not belong to this filesystem.
    #[error("{0}")]
    Mismatch(String),
    /// The filesystem is recognized but unusable.
    #[error("{0}")]
    Invalid(String),
}

impl HeaderError {
    pub(crate) fn into_error(self, format: &'static str, path: &Path) -> CarapaceError {
        match self {
            Self::Mismatch(reason) => CarapaceError::mismatch(format, reason),
            Self::Invalid(reason) => CarapaceError::InvalidImage {
                format,
                path: path.to_path_buf(),
                reason,
            },
        }
    }
}

/// How an image file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    ReadOnly,
    /// Read and write.
    ReadWrite,
}

impl OpenMode {
    /// Open `path` in this mode.
    pub fn open(self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(self == Self::ReadWrite)
            .open(path)
    }
}

/// Successful initialization result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initialized {
    /// Image is ready as requested.
    Ready,
    /// Image is ready but write access was dropped because the format is
    /// read-only.
    ReadOnly,
}

/// What to do with a SIF data or overlay partition whose filesystem header
/// fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionPolicy {
    /// Fail detection.
    #[default]
    Reject,
    /// Log a warning and leave the partition out.
    Drop,
}

/// Shared inputs of format initializers.
#[derive(Debug, Clone)]
pub struct DetectContext {
    /// Architecture compatibility oracle.
    pub arch: ArchOracle,
    /// Handling of corrupt secondary partitions.
    pub partition_policy: PartitionPolicy,
}

/// A recognized image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Plain directory.
    Sandbox,
    /// SIF container.
    Sif,
    /// Squashfs image.
    Squashfs,
    /// Ext3 image.
    Ext3,
}

impl Format {
    /// Detection priority.
    pub const DEFAULT_ORDER: [Self; 4] = [Self::Sandbox, Self::Sif, Self::Squashfs, Self::Ext3];

    /// Format name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Sif => "sif",
            Self::Squashfs => "squashfs",
            Self::Ext3 => "ext3",
        }
    }

    /// Open mode for a caller wanting `writable` access.
    #[must_use]
    pub const fn open_mode(self, writable: bool) -> OpenMode {
        match self {
            Self::Sandbox | Self::Squashfs => OpenMode::ReadOnly,
            Self::Sif | Self::Ext3 if writable => OpenMode::ReadWrite,
            Self::Sif | Self::Ext3 => OpenMode::ReadOnly,
        }
    }

    /// Recognize and populate `image`. A [`CarapaceError::FormatMismatch`]
    /// means another format should be tried.
    pub fn initialize(
        self,
        image: &mut Image,
        meta: &Metadata,
        ctx: &DetectContext,
    ) -> CarapaceResult<Initialized> {
        match self {
            Self::Sandbox => sandbox::initialize(image, meta),
            Self::Sif => sif::initialize(image, meta, ctx),
            Self::Squashfs => squashfs::initialize(image, meta),
            Self::Ext3 => ext3::initialize(image, meta),
        }
    }

    /// Lock the byte ranges this format protects.
    pub fn lock(self, image: &mut Image, locks: &Arc<LockRegistry>) -> CarapaceResult<()> {
        match self {
            Self::Sandbox => Ok(()),
            Self::Squashfs | Self::Ext3 => {
                let partitions = image.partitions.clone();
                for part in &partitions {
                    locks.lock_section(image, part)?;
                }
                Ok(())
            }
            Self::Sif => sif::lock(image, locks),
        }
    }
}

/// Read up to `len` bytes at `offset`, stopping early at end of file.
pub(crate) fn read_at_most(file: &File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
