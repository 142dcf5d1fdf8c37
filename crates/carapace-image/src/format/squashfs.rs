//! Squashfs images.

use std::fmt;
use std::fs::Metadata;

use carapace_common::{CarapaceError, CarapaceResult};

use super::{HEADER_BUFFER_SIZE, HeaderError, Initialized, launch_offset, read_at_most};
use crate::image::{Image, ImageType, ROOTFS_NAME, Section, SectionType, Usage};

/// Superblock magic, little-endian `0x73717368`.
pub const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";

/// Size of a version 4 superblock.
pub const SUPERBLOCK_SIZE: usize = 96;

/// Squashfs compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// zlib.
    Gzip,
    /// LZMA.
    Lzma,
    /// LZO.
    Lzo,
    /// XZ.
    Xz,
    /// LZ4.
    Lz4,
    /// Zstandard.
    Zstd,
}

impl Compression {
    /// Map a superblock compression id.
    #[must_use]
    pub const fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Gzip),
            2 => Some(Self::Lzma),
            3 => Some(Self::Lzo),
            4 => Some(Self::Xz),
            5 => Some(Self::Lz4),
            6 => Some(Self::Zstd),
            _ => None,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gzip => "gzip",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Fields of interest from a squashfs superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Offset of the superblock in the buffer.
    pub offset: u64,
    /// Major version, 3 or 4.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Compression, always gzip before version 4.
    pub compression: Compression,
    /// Bytes used by the filesystem, version 4 only.
    pub bytes_used: Option<u64>,
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Parse the superblock at the front of `buf`, skipping a launch stub.
pub fn parse_superblock(buf: &[u8]) -> Result<Superblock, HeaderError> {
    let offset = launch_offset(buf);
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    let sb = buf.get(start..).unwrap_or_default();

    if sb.len() < SQUASHFS_MAGIC.len() || &sb[..SQUASHFS_MAGIC.len()] != SQUASHFS_MAGIC {
        return Err(HeaderError::Mismatch("not a valid squashfs image".into()));
    }
    if sb.len() < SUPERBLOCK_SIZE {
        return Err(HeaderError::Invalid("truncated squashfs superblock".into()));
    }

    let major = le_u16(sb, 28);
    let minor = le_u16(sb, 30);
    match major {
        4 => {
            let id = le_u16(sb, 20);
            let compression = Compression::from_id(id).ok_or_else(|| {
                HeaderError::Invalid(format!("unsupported squashfs compression id {id}"))
            })?;
            Ok(Superblock {
                offset,
                major,
                minor,
                compression,
                bytes_used: Some(le_u64(sb, 40)),
            })
        }
        3 => Ok(Superblock {
            offset,
            major,
            minor,
            compression: Compression::Gzip,
            bytes_used: None,
        }),
        _ => Err(HeaderError::Invalid(format!(
            "unsupported squashfs version {major}.{minor}"
        ))),
    }
}

/// Validate a squashfs header and return the filesystem's starting offset.
pub fn check_header(buf: &[u8]) -> Result<u64, HeaderError> {
    parse_superblock(buf).map(|sb| sb.offset)
}

pub(super) fn initialize(image: &mut Image, meta: &Metadata) -> CarapaceResult<Initialized> {
    if meta.is_dir() {
        return Err(CarapaceError::mismatch("squashfs", "directory"));
    }

    let buf = read_at_most(&image.file, 0, HEADER_BUFFER_SIZE)?;
    let sb = parse_superblock(&buf).map_err(|e| e.into_error("squashfs", &image.path))?;

    let size = meta.len().saturating_sub(sb.offset);
    if let Some(used) = sb.bytes_used {
        if used > size {
            return Err(HeaderError::Invalid(format!(
                "image truncated: filesystem needs {used} bytes, {size} available"
            ))
            .into_error("squashfs", &image.path));
        }
    }

    tracing::debug!(
        path = %image.path.display(),
        offset = sb.offset,
        compression = %sb.compression,
        "Detected squashfs image"
    );

    image.image_type = ImageType::Squashfs;
    image.partitions = vec![Section {
        name: ROOTFS_NAME.to_string(),
        size,
        offset: sb.offset,
        id: 0,
        section_type: SectionType::Filesystem(ImageType::Squashfs),
        allowed_usage: Usage::ROOTFS | Usage::OVERLAY | Usage::DATA,
    }];

    if image.writable {
        tracing::warn!(path = %image.path.display(), "squashfs is not a writable filesystem");
        image.writable = false;
        return Ok(Initialized::ReadOnly);
    }
    Ok(Initialized::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn parses_v4_superblock() {
        let img = testutil::squashfs_image(8192, 4);
        let sb = parse_superblock(&img).unwrap();
        assert_eq!(sb.offset, 0);
        assert_eq!(sb.major, 4);
        assert_eq!(sb.compression, Compression::Xz);
        assert_eq!(sb.bytes_used, Some(8192));
    }

    #[test]
    fn launch_stub_shifts_offset() {
        let img = testutil::with_launch_stub(&testutil::squashfs_image(4096, 1));
        assert_eq!(check_header(&img).unwrap(), 31);
    }

    #[test]
    fn unknown_compression_is_hard_error() {
        let img = testutil::squashfs_image(4096, 42);
        assert!(matches!(
            parse_superblock(&img),
            Err(HeaderError::Invalid(_))
        ));
    }

    #[test]
    fn other_magic_is_mismatch() {
        assert!(matches!(
            parse_superblock(&[0u8; 128]),
            Err(HeaderError::Mismatch(_))
        ));
    }
}
