//! # carapace-image
//!
//! Container image handling for Carapace.
//!
//! This crate provides:
//! - Format detection for sandbox directories, SIF, squashfs and ext3 images
//! - Partition and section discovery, including SIF descriptor tables
//! - Byte-range locking of image sections across and within processes
//! - Bounded readers over partitions and sections

#![warn(missing_docs)]

pub mod arch;
pub mod detect;
pub mod format;
pub mod image;
pub mod lock;
pub mod reader;
#[cfg(any(test, feature = "testutil"))]
#[allow(missing_docs, clippy::missing_panics_doc)]
pub mod testutil;

pub use arch::ArchOracle;
pub use detect::Detector;
pub use format::{Format, PartitionPolicy};
pub use image::{Image, ImageType, ROOTFS_NAME, Section, SectionType, Usage};
pub use lock::LockRegistry;
pub use reader::{SectionReader, partition_reader, section_reader};
