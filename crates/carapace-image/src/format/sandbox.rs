//! Sandbox images: plain directory trees.

use std::fs::Metadata;

use carapace_common::{CarapaceError, CarapaceResult};

use super::Initialized;
use crate::image::{Image, ImageType, ROOTFS_NAME, Section, SectionType, Usage};

pub(super) fn initialize(image: &mut Image, meta: &Metadata) -> CarapaceResult<Initialized> {
    if !meta.is_dir() {
        return Err(CarapaceError::mismatch("sandbox", "not a directory"));
    }

    image.image_type = ImageType::Sandbox;
    image.partitions = vec![Section {
        name: ROOTFS_NAME.to_string(),
        size: 0,
        offset: 0,
        id: 0,
        section_type: SectionType::Filesystem(ImageType::Sandbox),
        allowed_usage: Usage::ROOTFS | Usage::OVERLAY | Usage::DATA,
    }];
    Ok(Initialized::Ready)
}
