//! Ext3 images.

use std::fs::Metadata;

use carapace_common::{CarapaceError, CarapaceResult};

use super::{HEADER_BUFFER_SIZE, HeaderError, Initialized, launch_offset, read_at_most};
use crate::image::{Image, ImageType, ROOTFS_NAME, Section, SectionType, Usage};

/// Offset of the superblock from the start of the filesystem.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Offset of the superblock magic from the start of the filesystem.
pub const MAGIC_OFFSET: u64 = 1080;
/// Superblock magic, little-endian `0xEF53`.
pub const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];

/// `s_feature_compat`: has a journal.
pub const COMPAT_HAS_JOURNAL: u32 = 0x4;
/// `s_feature_incompat`: directory entries record file type.
pub const INCOMPAT_FILETYPE: u32 = 0x2;
/// `s_feature_incompat`: journal needs recovery.
pub const INCOMPAT_RECOVER: u32 = 0x4;
/// `s_feature_incompat`: meta block groups.
pub const INCOMPAT_META_BG: u32 = 0x10;
/// `s_feature_ro_compat`: sparse superblocks.
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x1;
/// `s_feature_ro_compat`: files larger than 2GiB.
pub const RO_COMPAT_LARGE_FILE: u32 = 0x2;
/// `s_feature_ro_compat`: B-tree directories.
pub const RO_COMPAT_BTREE_DIR: u32 = 0x4;

const ALLOWED_INCOMPAT: u32 = INCOMPAT_FILETYPE | INCOMPAT_RECOVER | INCOMPAT_META_BG;
const ALLOWED_RO_COMPAT: u32 = RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE | RO_COMPAT_BTREE_DIR;

/// Fields of interest from an ext3 superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Offset at which the filesystem starts in the buffer.
    pub offset: u64,
    /// Total block count.
    pub blocks_count: u32,
    /// Block size in bytes.
    pub block_size: u64,
    /// Compatible features.
    pub compat: u32,
    /// Incompatible features.
    pub incompat: u32,
    /// Read-only compatible features.
    pub ro_compat: u32,
}

impl Superblock {
    /// Size of the filesystem in bytes.
    #[must_use]
    pub const fn fs_size(&self) -> u64 {
        self.blocks_count as u64 * self.block_size
    }
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Parse and validate the superblock, skipping a launch stub.
pub fn parse_superblock(buf: &[u8]) -> Result<Superblock, HeaderError> {
    let offset = launch_offset(buf);
    let fs = usize::try_from(offset)
        .ok()
        .and_then(|start| buf.get(start..))
        .unwrap_or_default();

    // Magic, state and eight words before the feature fields.
    let magic_at = MAGIC_OFFSET as usize;
    let features_end = magic_at + 2 + 2 + 32 + 12;
    if fs.len() < magic_at + EXT_MAGIC.len() || fs[magic_at..magic_at + 2] != EXT_MAGIC {
        return Err(HeaderError::Mismatch("not a valid ext3 image".into()));
    }
    if fs.len() < features_end {
        return Err(HeaderError::Invalid("truncated ext3 superblock".into()));
    }

    let sb_at = SUPERBLOCK_OFFSET as usize;
    let log_block_size = le_u32(fs, sb_at + 24);
    if log_block_size > 6 {
        return Err(HeaderError::Invalid(format!(
            "invalid block size exponent {log_block_size}"
        )));
    }

    let feature_at = magic_at + 36;
    let sb = Superblock {
        offset,
        blocks_count: le_u32(fs, sb_at + 4),
        block_size: 1024 << log_block_size,
        compat: le_u32(fs, feature_at),
        incompat: le_u32(fs, feature_at + 4),
        ro_compat: le_u32(fs, feature_at + 8),
    };

    if sb.compat & COMPAT_HAS_JOURNAL == 0 {
        return Err(HeaderError::Invalid("image must have a journal".into()));
    }
    if sb.incompat & !ALLOWED_INCOMPAT != 0 {
        return Err(HeaderError::Invalid(format!(
            "image contains unsupported incompatible features {:#x}",
            sb.incompat & !ALLOWED_INCOMPAT
        )));
    }
    if sb.ro_compat & !ALLOWED_RO_COMPAT != 0 {
        return Err(HeaderError::Invalid(format!(
            "image contains unsupported read-only compatible features {:#x}",
            sb.ro_compat & !ALLOWED_RO_COMPAT
        )));
    }
    Ok(sb)
}

/// Validate an ext3 header and return the filesystem's starting offset.
pub fn check_header(buf: &[u8]) -> Result<u64, HeaderError> {
    parse_superblock(buf).map(|sb| sb.offset)
}

pub(super) fn initialize(image: &mut Image, meta: &Metadata) -> CarapaceResult<Initialized> {
    if meta.is_dir() {
        return Err(CarapaceError::mismatch("ext3", "directory"));
    }

    let buf = read_at_most(&image.file, 0, HEADER_BUFFER_SIZE)?;
    let sb = parse_superblock(&buf).map_err(|e| e.into_error("ext3", &image.path))?;

    let size = meta.len().saturating_sub(sb.offset);
    if sb.fs_size() > size {
        return Err(CarapaceError::InvalidImage {
            format: "ext3",
            path: image.path.clone(),
            reason: format!(
                "image truncated: filesystem needs {} bytes, {size} available",
                sb.fs_size()
            ),
        });
    }

    tracing::debug!(path = %image.path.display(), offset = sb.offset, "Detected ext3 image");

    image.image_type = ImageType::Ext3;
    image.partitions = vec![Section {
        name: ROOTFS_NAME.to_string(),
        size,
        offset: sb.offset,
        id: 0,
        section_type: SectionType::Filesystem(ImageType::Ext3),
        allowed_usage: Usage::ROOTFS | Usage::OVERLAY | Usage::DATA,
    }];
    Ok(Initialized::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn parses_valid_superblock() {
        let img = testutil::ext3_image(64 * 1024);
        let sb = parse_superblock(&img).unwrap();
        assert_eq!(sb.offset, 0);
        assert_eq!(sb.block_size, 1024);
        assert_eq!(sb.fs_size(), 64 * 1024);
    }

    #[test]
    fn launch_stub_shifts_offset() {
        let img = testutil::with_launch_stub(&testutil::ext3_image(64 * 1024));
        assert_eq!(check_header(&img).unwrap(), 31);
    }

    #[test]
    fn journal_is_required() {
        let mut img = testutil::ext3_image(64 * 1024);
        img[1116..1120].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(parse_superblock(&img), Err(HeaderError::Invalid(_))));
    }

    #[test]
    fn extents_are_rejected() {
        let mut img = testutil::ext3_image(64 * 1024);
        // INCOMPAT_EXTENTS
        let incompat = INCOMPAT_FILETYPE | 0x40;
        img[1120..1124].copy_from_slice(&incompat.to_le_bytes());
        let err = parse_superblock(&img).unwrap_err();
        assert!(err.to_string().contains("incompatible features"));
    }

    #[test]
    fn short_buffer_is_mismatch() {
        assert!(matches!(
            parse_superblock(&[0u8; 512]),
            Err(HeaderError::Mismatch(_))
        ));
    }
}
