//! SIF container images.
//!
//! A SIF file starts with a fixed global header pointing at a table of
//! fixed-size descriptors. Each descriptor names a data object in the file.
//! Partition descriptors carry a filesystem type, a partition type and a
//! target architecture in their extra area; the primary system partition
//! becomes the root filesystem.
//!
//! All integers are little-endian and structures are packed.

use std::fs::{File, Metadata};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use carapace_common::{CarapaceError, CarapaceResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{DetectContext, HEADER_BUFFER_SIZE, HeaderError, Initialized, PartitionPolicy};
use super::{ext3, read_at_most, squashfs};
use crate::arch::sif_arch_name;
use crate::image::{Image, ImageType, ROOTFS_NAME, Section, SectionType, Usage};
use crate::lock::LockRegistry;

/// Header magic, NUL-terminated in the file.
pub const SIF_MAGIC: &[u8; 9] = b"SIF_MAGIC";
/// Supported header version.
pub const SIF_VERSION: &[u8; 2] = b"01";

/// Size of the global header.
pub const HEADER_SIZE: usize = 128;
/// Size of one descriptor.
pub const DESCRIPTOR_SIZE: usize = 585;
/// Size of the descriptor name field.
pub const NAME_SIZE: usize = 128;
/// Size of the descriptor extra field.
pub const EXTRA_SIZE: usize = 384;
/// Bits of the group field that mark it as a group ID.
pub const GROUP_MASK: u32 = 0xf000_0000;

const LAUNCH_SIZE: usize = 32;
const MAGIC_AT: usize = LAUNCH_SIZE;
const VERSION_AT: usize = MAGIC_AT + 10;
const ID_AT: usize = VERSION_AT + 6;
const CREATED_AT: usize = ID_AT + 16;
const MODIFIED_AT: usize = CREATED_AT + 8;
const DESCR_FREE_AT: usize = MODIFIED_AT + 8;
const DESCR_TOTAL_AT: usize = DESCR_FREE_AT + 8;
const DESCR_OFFSET_AT: usize = DESCR_TOTAL_AT + 8;
const DESCR_SIZE_AT: usize = DESCR_OFFSET_AT + 8;
const DATA_OFFSET_AT: usize = DESCR_SIZE_AT + 8;
const DATA_SIZE_AT: usize = DATA_OFFSET_AT + 8;

const MAX_DESCRIPTORS: u64 = 1 << 16;

/// Data object type of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    /// Definition file used to build the image.
    Deffile,
    /// Environment variables.
    EnvVar,
    /// JSON labels.
    Labels,
    /// Filesystem partition.
    Partition,
    /// Signature of another object.
    Signature,
    /// Arbitrary JSON.
    GenericJson,
    /// Arbitrary bytes.
    Generic,
    /// Encrypted key material.
    CryptoMessage,
    /// Software bill of materials.
    Sbom,
    /// OCI image index.
    OciRootIndex,
    /// OCI blob.
    OciBlob,
    /// Any other non-zero type.
    Other(i32),
}

impl DataType {
    /// Map a raw descriptor data type. Zero means an unused slot.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => return None,
            0x4001 => Self::Deffile,
            0x4002 => Self::EnvVar,
            0x4003 => Self::Labels,
            0x4004 => Self::Partition,
            0x4005 => Self::Signature,
            0x4006 => Self::GenericJson,
            0x4007 => Self::Generic,
            0x4008 => Self::CryptoMessage,
            0x4009 => Self::Sbom,
            0x400a => Self::OciRootIndex,
            0x400b => Self::OciBlob,
            other => Self::Other(other),
        })
    }

    /// Raw descriptor value.
    #[must_use]
    pub const fn raw(self) -> i32 {
        match self {
            Self::Deffile => 0x4001,
            Self::EnvVar => 0x4002,
            Self::Labels => 0x4003,
            Self::Partition => 0x4004,
            Self::Signature => 0x4005,
            Self::GenericJson => 0x4006,
            Self::Generic => 0x4007,
            Self::CryptoMessage => 0x4008,
            Self::Sbom => 0x4009,
            Self::OciRootIndex => 0x400a,
            Self::OciBlob => 0x400b,
            Self::Other(raw) => raw,
        }
    }
}

/// Filesystem type stored in a partition descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    /// Squashfs.
    Squash,
    /// Ext3.
    Ext3,
    /// Immutable object archive.
    ImmuObj,
    /// Raw bytes.
    Raw,
    /// Encrypted squashfs.
    EncryptedSquashfs,
    /// Unknown value.
    Unknown(i32),
}

impl FsType {
    /// Map a raw value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Squash,
            2 => Self::Ext3,
            3 => Self::ImmuObj,
            4 => Self::Raw,
            5 => Self::EncryptedSquashfs,
            other => Self::Unknown(other),
        }
    }

    /// Raw descriptor value.
    #[must_use]
    pub const fn raw(self) -> i32 {
        match self {
            Self::Squash => 1,
            Self::Ext3 => 2,
            Self::ImmuObj => 3,
            Self::Raw => 4,
            Self::EncryptedSquashfs => 5,
            Self::Unknown(raw) => raw,
        }
    }

    const fn image_type(self) -> Option<ImageType> {
        match self {
            Self::Squash => Some(ImageType::Squashfs),
            Self::Ext3 => Some(ImageType::Ext3),
            Self::Raw => Some(ImageType::Raw),
            Self::EncryptedSquashfs => Some(ImageType::EncryptedSquashfs),
            Self::ImmuObj | Self::Unknown(_) => None,
        }
    }
}

/// Partition type stored in a partition descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    /// Secondary system partition.
    System,
    /// Primary system partition, the root filesystem.
    PrimSys,
    /// Data partition.
    Data,
    /// Writable overlay partition.
    Overlay,
    /// Unknown value.
    Unknown(i32),
}

impl PartType {
    /// Map a raw value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::System,
            2 => Self::PrimSys,
            3 => Self::Data,
            4 => Self::Overlay,
            other => Self::Unknown(other),
        }
    }

    /// Raw descriptor value.
    #[must_use]
    pub const fn raw(self) -> i32 {
        match self {
            Self::System => 1,
            Self::PrimSys => 2,
            Self::Data => 3,
            Self::Overlay => 4,
            Self::Unknown(raw) => raw,
        }
    }
}

fn le_i32(b: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_i64(b: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[at..at + 8]);
    i64::from_le_bytes(raw)
}

fn c_string(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

fn non_negative(v: i64, what: &str) -> Result<u64, HeaderError> {
    u64::try_from(v).map_err(|_| HeaderError::Invalid(format!("negative {what}: {v}")))
}

/// The SIF global header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Image UUID.
    pub id: Uuid,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
    /// Modification time.
    pub modified: Option<DateTime<Utc>>,
    /// Free descriptor slots.
    pub descriptors_free: u64,
    /// Total descriptor slots.
    pub descriptors_total: u64,
    /// Offset of the descriptor table.
    pub descriptors_offset: u64,
    /// Size of the descriptor table.
    pub descriptors_size: u64,
    /// Offset of the data area.
    pub data_offset: u64,
    /// Size of the data area.
    pub data_size: u64,
}

impl Header {
    /// Parse the global header from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < VERSION_AT || &buf[MAGIC_AT..MAGIC_AT + SIF_MAGIC.len()] != SIF_MAGIC {
            return Err(HeaderError::Mismatch("SIF magic not found".into()));
        }
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Invalid("truncated SIF header".into()));
        }
        if &buf[VERSION_AT..VERSION_AT + SIF_VERSION.len()] != SIF_VERSION {
            return Err(HeaderError::Invalid(format!(
                "unsupported SIF version {}",
                c_string(&buf[VERSION_AT..VERSION_AT + 3])
            )));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[ID_AT..ID_AT + 16]);

        Ok(Self {
            id: Uuid::from_bytes(id),
            created: DateTime::from_timestamp(le_i64(buf, CREATED_AT), 0),
            modified: DateTime::from_timestamp(le_i64(buf, MODIFIED_AT), 0),
            descriptors_free: non_negative(le_i64(buf, DESCR_FREE_AT), "free descriptor count")?,
            descriptors_total: non_negative(le_i64(buf, DESCR_TOTAL_AT), "descriptor count")?,
            descriptors_offset: non_negative(le_i64(buf, DESCR_OFFSET_AT), "descriptor offset")?,
            descriptors_size: non_negative(le_i64(buf, DESCR_SIZE_AT), "descriptor size")?,
            data_offset: non_negative(le_i64(buf, DATA_OFFSET_AT), "data offset")?,
            data_size: non_negative(le_i64(buf, DATA_SIZE_AT), "data size")?,
        })
    }

    fn validate(&self, file_size: u64) -> Result<(), HeaderError> {
        if self.descriptors_total > MAX_DESCRIPTORS
            || self.descriptors_free > self.descriptors_total
        {
            return Err(HeaderError::Invalid(format!(
                "corrupted descriptor table: {} total, {} free",
                self.descriptors_total, self.descriptors_free
            )));
        }
        let table = self.descriptors_total * DESCRIPTOR_SIZE as u64;
        if self.descriptors_size < table
            || self.descriptors_offset.saturating_add(table) > file_size
        {
            return Err(HeaderError::Invalid(
                "corrupted descriptor table: extends past end of file".into(),
            ));
        }
        Ok(())
    }
}

/// One entry of the descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Data object type, `None` for an unused slot.
    pub data_type: Option<DataType>,
    /// Whether the slot is in use.
    pub used: bool,
    /// Descriptor ID.
    pub id: u32,
    /// Group ID with the group mask removed, zero when ungrouped.
    pub group_id: u32,
    /// ID of a linked descriptor or group.
    pub linked_id: u32,
    /// Offset of the object.
    pub offset: u64,
    /// Size of the object.
    pub size: u64,
    /// Object name.
    pub name: String,
    /// Raw extra area.
    pub extra: Vec<u8>,
}

impl Descriptor {
    /// Parse one descriptor.
    pub fn parse(b: &[u8]) -> Result<Self, HeaderError> {
        if b.len() < DESCRIPTOR_SIZE {
            return Err(HeaderError::Invalid("truncated SIF descriptor".into()));
        }
        Ok(Self {
            data_type: DataType::from_raw(le_i32(b, 0)),
            used: b[4] != 0,
            id: le_u32(b, 5),
            group_id: le_u32(b, 9) & !GROUP_MASK,
            linked_id: le_u32(b, 13),
            offset: non_negative(le_i64(b, 17), "descriptor offset")?,
            size: non_negative(le_i64(b, 25), "descriptor size")?,
            name: c_string(&b[73..73 + NAME_SIZE]),
            extra: b[73 + NAME_SIZE..DESCRIPTOR_SIZE].to_vec(),
        })
    }

    /// Partition metadata: filesystem type, partition type and SIF
    /// architecture code.
    #[must_use]
    pub fn partition_metadata(&self) -> Option<(FsType, PartType, String)> {
        if self.data_type != Some(DataType::Partition) {
            return None;
        }
        Some((
            FsType::from_raw(le_i32(&self.extra, 0)),
            PartType::from_raw(le_i32(&self.extra, 4)),
            c_string(&self.extra[8..11]),
        ))
    }
}

/// Read and validate the descriptor table.
pub fn load_descriptors(file: &File, header: &Header) -> Result<Vec<Descriptor>, HeaderError> {
    let len = usize::try_from(header.descriptors_total)
        .map_err(|_| HeaderError::Invalid("descriptor table too large".into()))?
        * DESCRIPTOR_SIZE;
    let mut table = vec![0u8; len];
    file.read_exact_at(&mut table, header.descriptors_offset)
        .map_err(|e| HeaderError::Invalid(format!("can't read descriptor table: {e}")))?;

    let mut descriptors = Vec::new();
    for raw in table.chunks_exact(DESCRIPTOR_SIZE) {
        let descr = Descriptor::parse(raw)?;
        if descr.used {
            descriptors.push(descr);
        }
    }
    Ok(descriptors)
}

/// Check an embedded filesystem header and return its type.
fn check_partition(file: &File, descr: &Descriptor, fs: FsType) -> Result<ImageType, HeaderError> {
    let image_type = fs.image_type().ok_or_else(|| {
        HeaderError::Invalid(format!(
            "partition {:?} has unsupported filesystem type {}",
            descr.name,
            fs.raw()
        ))
    })?;

    let want = usize::try_from(descr.size)
        .unwrap_or(usize::MAX)
        .min(HEADER_BUFFER_SIZE);
    if !matches!(image_type, ImageType::Squashfs | ImageType::Ext3) {
        return Ok(image_type);
    }
    let header = read_at_most(file, descr.offset, want)
        .map_err(|e| HeaderError::Invalid(format!("can't read partition header: {e}")))?;

    match image_type {
        ImageType::Squashfs => {
            let sb = squashfs::parse_superblock(&header)?;
            if sb.bytes_used.is_some_and(|used| used > descr.size) {
                return Err(HeaderError::Invalid(format!(
                    "squashfs partition {:?} is truncated",
                    descr.name
                )));
            }
        }
        _ => {
            let sb = ext3::parse_superblock(&header)?;
            if sb.fs_size() > descr.size {
                return Err(HeaderError::Invalid(format!(
                    "ext3 partition {:?} is truncated",
                    descr.name
                )));
            }
        }
    }
    Ok(image_type)
}

fn partition_error(path: &Path, descr: &Descriptor, err: &HeaderError) -> CarapaceError {
    CarapaceError::InvalidImage {
        format: "sif",
        path: path.to_path_buf(),
        reason: format!("error while checking partition {:?} header: {err}", descr.name),
    }
}

pub(super) fn initialize(
    image: &mut Image,
    meta: &Metadata,
    ctx: &DetectContext,
) -> CarapaceResult<Initialized> {
    if meta.is_dir() {
        return Err(CarapaceError::mismatch("sif", "directory"));
    }

    let buf = read_at_most(&image.file, 0, HEADER_BUFFER_SIZE)?;
    let header = Header::parse(&buf).map_err(|e| e.into_error("sif", &image.path))?;
    let file_size = meta.len();
    header
        .validate(file_size)
        .map_err(|e| e.into_error("sif", &image.path))?;
    let descriptors =
        load_descriptors(&image.file, &header).map_err(|e| e.into_error("sif", &image.path))?;

    for d in &descriptors {
        if d.offset.saturating_add(d.size) > file_size {
            return Err(CarapaceError::InvalidImage {
                format: "sif",
                path: image.path.clone(),
                reason: format!("object {} ({:?}) extends past end of file", d.id, d.name),
            });
        }
    }

    let mut partitions = Vec::new();
    let mut sections = Vec::new();

    let primary = descriptors.iter().find_map(|d| match d.partition_metadata() {
        Some((fs, PartType::PrimSys, arch)) => Some((d, fs, arch)),
        _ => None,
    });

    let mut primary_group = None;
    if let Some((part, fs, arch)) = &primary {
        let arch_name = sif_arch_name(&arch).unwrap_or("unknown");
        if !ctx.arch.is_compatible(arch_name) {
            return Err(CarapaceError::IncompatibleArch {
                image: arch_name.to_string(),
                host: ctx.arch.host().to_string(),
            });
        }

        let fs_type = check_partition(&image.file, part, *fs)
            .map_err(|e| partition_error(&image.path, part, &e))?;

        partitions.push(Section {
            name: ROOTFS_NAME.to_string(),
            size: part.size,
            offset: part.offset,
            id: part.id,
            section_type: SectionType::Filesystem(fs_type),
            allowed_usage: Usage::ROOTFS,
        });
        primary_group = Some(part.group_id);
    }

    for d in &descriptors {
        if primary.as_ref().is_some_and(|(p, _, _)| p.id == d.id) {
            continue;
        }
        let Some(data_type) = d.data_type else {
            continue;
        };

        let Some((fs, part, _)) = d.partition_metadata() else {
            sections.push(Section {
                name: d.name.clone(),
                size: d.size,
                offset: d.offset,
                id: d.id,
                section_type: SectionType::Object(data_type),
                allowed_usage: Usage::empty(),
            });
            continue;
        };

        let usage = match part {
            PartType::Data => Usage::DATA,
            PartType::Overlay if primary_group.is_none_or(|g| g == d.group_id) => Usage::OVERLAY,
            _ => continue,
        };

        let fs_type = match check_partition(&image.file, d, fs) {
            Ok(t) => t,
            Err(e) => match ctx.partition_policy {
                PartitionPolicy::Reject => return Err(partition_error(&image.path, d, &e)),
                PartitionPolicy::Drop => {
                    tracing::warn!(
                        path = %image.path.display(),
                        partition = %d.name,
                        error = %e,
                        "Ignoring partition with invalid filesystem header"
                    );
                    continue;
                }
            },
        };

        partitions.push(Section {
            name: d.name.clone(),
            size: d.size,
            offset: d.offset,
            id: d.id,
            section_type: SectionType::Filesystem(fs_type),
            allowed_usage: usage,
        });
    }

    tracing::debug!(
        path = %image.path.display(),
        id = %header.id,
        partitions = partitions.len(),
        sections = sections.len(),
        "Detected SIF image"
    );

    image.image_type = ImageType::Sif;
    image.partitions = partitions;
    image.sections = sections;
    Ok(Initialized::Ready)
}

/// Lock every ext3 partition; squashfs partitions are immutable.
pub(super) fn lock(image: &mut Image, locks: &Arc<LockRegistry>) -> CarapaceResult<()> {
    let ext3: Vec<Section> = image
        .partitions
        .iter()
        .filter(|p| p.fs_type() == Some(ImageType::Ext3))
        .cloned()
        .collect();
    for part in &ext3 {
        locks.lock_section(image, part)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{SifBuilder, squashfs_image};

    #[test]
    fn header_round_trips_through_builder() {
        let bytes = SifBuilder::new("amd64")
            .primary(FsType::Squash, squashfs_image(4096, 1))
            .build();
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.descriptors_total, 1);
        assert_eq!(header.descriptors_free, 0);
        assert!(header.validate(bytes.len() as u64).is_ok());
    }

    #[test]
    fn missing_magic_is_mismatch() {
        let bytes = vec![0u8; HEADER_SIZE];
        assert!(matches!(Header::parse(&bytes), Err(HeaderError::Mismatch(_))));
    }

    #[test]
    fn bad_version_is_invalid() {
        let mut bytes = SifBuilder::new("amd64").build();
        bytes[VERSION_AT..VERSION_AT + 2].copy_from_slice(b"09");
        assert!(matches!(Header::parse(&bytes), Err(HeaderError::Invalid(_))));
    }

    #[test]
    fn descriptor_table_past_eof_is_invalid() {
        let bytes = SifBuilder::new("amd64")
            .primary(FsType::Squash, squashfs_image(4096, 1))
            .build();
        let header = Header::parse(&bytes).unwrap();
        assert!(header.validate(HEADER_SIZE as u64).is_err());
    }

    #[test]
    fn group_mask_is_stripped() {
        let bytes = SifBuilder::new("amd64")
            .primary(FsType::Squash, squashfs_image(4096, 1))
            .build();
        let header = Header::parse(&bytes).unwrap();
        let at = usize::try_from(header.descriptors_offset).unwrap();
        let descr = Descriptor::parse(&bytes[at..at + DESCRIPTOR_SIZE]).unwrap();
        assert_eq!(descr.group_id, 1);
        let (fs, part, arch) = descr.partition_metadata().unwrap();
        assert_eq!(fs, FsType::Squash);
        assert_eq!(part, PartType::PrimSys);
        assert_eq!(arch, "02");
    }

    #[test]
    fn data_type_mapping() {
        assert_eq!(DataType::from_raw(0), None);
        assert_eq!(DataType::from_raw(0x4006), Some(DataType::GenericJson));
        assert_eq!(DataType::Other(7).raw(), 7);
    }
}
