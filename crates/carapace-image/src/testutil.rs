//! Byte-exact image fixtures for tests.
//!
//! Only the headers the detector inspects are filled in; the rest of each
//! image is zeroes.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::arch::sif_arch_code;
use crate::format::sif::{
    DESCRIPTOR_SIZE, DataType, FsType, GROUP_MASK, HEADER_SIZE, NAME_SIZE, PartType, SIF_MAGIC,
    SIF_VERSION,
};

/// Launch stub placed in front of self-executing images.
pub const LAUNCH_STUB: &[u8] = b"#!/usr/bin/env run-singularity\n";

/// A version 4 squashfs image of `size` bytes using `compression` id.
#[must_use]
pub fn squashfs_image(size: usize, compression: u16) -> Vec<u8> {
    let mut img = vec![0u8; size.max(96)];
    img[..4].copy_from_slice(b"hsqs");
    img[20..22].copy_from_slice(&compression.to_le_bytes());
    img[28..30].copy_from_slice(&4u16.to_le_bytes());
    img[40..48].copy_from_slice(&(size as u64).to_le_bytes());
    img
}

/// A version 3 squashfs image of `size` bytes.
#[must_use]
pub fn squashfs_v3_image(size: usize) -> Vec<u8> {
    let mut img = vec![0u8; size.max(96)];
    img[..4].copy_from_slice(b"hsqs");
    img[28..30].copy_from_slice(&3u16.to_le_bytes());
    img[30..32].copy_from_slice(&1u16.to_le_bytes());
    img
}

/// A journaled ext3 image of `size` bytes with 1KiB blocks.
#[must_use]
pub fn ext3_image(size: usize) -> Vec<u8> {
    let mut img = vec![0u8; size.max(2048)];
    let blocks = u32::try_from(size / 1024).unwrap_or(u32::MAX);
    img[1028..1032].copy_from_slice(&blocks.to_le_bytes());
    img[1048..1052].copy_from_slice(&0u32.to_le_bytes());
    img[1080..1082].copy_from_slice(&[0x53, 0xEF]);
    // has_journal; filetype; sparse_super | large_file
    img[1116..1120].copy_from_slice(&0x4u32.to_le_bytes());
    img[1120..1124].copy_from_slice(&0x2u32.to_le_bytes());
    img[1124..1128].copy_from_slice(&0x3u32.to_le_bytes());
    img
}

/// Prefix `image` with [`LAUNCH_STUB`].
#[must_use]
pub fn with_launch_stub(image: &[u8]) -> Vec<u8> {
    let mut out = LAUNCH_STUB.to_vec();
    out.extend_from_slice(image);
    out
}

/// Write `bytes` to `dir/name` and return the path.
pub fn write_image(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("create fixture");
    file.write_all(bytes).expect("write fixture");
    path
}

struct Object {
    data_type: DataType,
    group: u32,
    name: String,
    extra: Vec<u8>,
    data: Vec<u8>,
}

/// Assembles SIF files.
pub struct SifBuilder {
    arch: String,
    objects: Vec<Object>,
    created: i64,
}

impl SifBuilder {
    /// New image whose partitions target `arch`, in SIF naming.
    #[must_use]
    pub fn new(arch: &str) -> Self {
        Self {
            arch: arch.to_string(),
            objects: Vec::new(),
            created: 1_700_000_000,
        }
    }

    /// Add the primary system partition, in group 1.
    #[must_use]
    pub fn primary(self, fs: FsType, data: Vec<u8>) -> Self {
        self.partition("rootfs", 1, fs, PartType::PrimSys, data)
    }

    /// Add a partition.
    #[must_use]
    pub fn partition(
        mut self,
        name: &str,
        group: u32,
        fs: FsType,
        part: PartType,
        data: Vec<u8>,
    ) -> Self {
        let mut extra = vec![0u8; 12];
        extra[0..4].copy_from_slice(&fs.raw().to_le_bytes());
        extra[4..8].copy_from_slice(&part.raw().to_le_bytes());
        let code = sif_arch_code(&self.arch).unwrap_or("00");
        extra[8..10].copy_from_slice(code.as_bytes());
        self.objects.push(Object {
            data_type: DataType::Partition,
            group,
            name: name.to_string(),
            extra,
            data,
        });
        self
    }

    /// Add a non-partition object.
    #[must_use]
    pub fn object(mut self, data_type: DataType, name: &str, data: Vec<u8>) -> Self {
        self.objects.push(Object {
            data_type,
            group: 1,
            name: name.to_string(),
            extra: Vec::new(),
            data,
        });
        self
    }

    /// Serialize the image.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let count = self.objects.len();
        let table = count * DESCRIPTOR_SIZE;
        let data_start = (HEADER_SIZE + table).next_multiple_of(4096);
        let data_len: usize = self
            .objects
            .iter()
            .map(|o| o.data.len().next_multiple_of(4096))
            .sum();

        let mut out = vec![0u8; data_start + data_len];
        out[..LAUNCH_STUB.len()].copy_from_slice(LAUNCH_STUB);
        out[32..32 + SIF_MAGIC.len()].copy_from_slice(SIF_MAGIC);
        out[42..42 + SIF_VERSION.len()].copy_from_slice(SIF_VERSION);
        out[48..64].copy_from_slice(&[0xab; 16]);
        let fields: [i64; 8] = [
            self.created,
            self.created,
            0,
            count as i64,
            HEADER_SIZE as i64,
            table as i64,
            data_start as i64,
            data_len as i64,
        ];
        for (i, v) in fields.iter().enumerate() {
            out[64 + i * 8..72 + i * 8].copy_from_slice(&v.to_le_bytes());
        }

        let mut offset = data_start;
        for (i, obj) in self.objects.iter().enumerate() {
            let d = HEADER_SIZE + i * DESCRIPTOR_SIZE;
            let id = u32::try_from(i + 1).expect("descriptor id");
            out[d..d + 4].copy_from_slice(&obj.data_type.raw().to_le_bytes());
            out[d + 4] = 1;
            out[d + 5..d + 9].copy_from_slice(&id.to_le_bytes());
            out[d + 9..d + 13].copy_from_slice(&(obj.group | GROUP_MASK).to_le_bytes());
            out[d + 17..d + 25].copy_from_slice(&(offset as i64).to_le_bytes());
            out[d + 25..d + 33].copy_from_slice(&(obj.data.len() as i64).to_le_bytes());
            let padded = obj.data.len().next_multiple_of(4096);
            out[d + 33..d + 41].copy_from_slice(&(padded as i64).to_le_bytes());
            let name = obj.name.as_bytes();
            let name_len = name.len().min(NAME_SIZE - 1);
            out[d + 73..d + 73 + name_len].copy_from_slice(&name[..name_len]);
            let extra = d + 73 + NAME_SIZE;
            out[extra..extra + obj.extra.len()].copy_from_slice(&obj.extra);

            out[offset..offset + obj.data.len()].copy_from_slice(&obj.data);
            offset += padded;
        }
        out
    }
}
