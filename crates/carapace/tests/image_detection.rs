//! End-to-end image detection over synthesized images.

use std::io::Read;
use std::sync::Arc;

use carapace::image::format::sif::{DataType, FsType, PartType};
use carapace::image::testutil::{
    SifBuilder, ext3_image, squashfs_image, squashfs_v3_image, with_launch_stub, write_image,
};
use carapace::image::{
    ArchOracle, Detector, ImageType, LockRegistry, PartitionPolicy, ROOTFS_NAME, Usage,
    section_reader,
};
use carapace_common::{CarapaceError, LockDirection, LockHolder};
use tempfile::TempDir;

fn detector(dir: &TempDir) -> Detector {
    let binfmt = dir.path().join("binfmt");
    std::fs::create_dir_all(&binfmt).unwrap();
    Detector::default()
        .with_locks(Arc::new(LockRegistry::new()))
        .with_arch(ArchOracle::new(binfmt).with_host("amd64"))
}

fn truncated(mut bytes: Vec<u8>, len: usize) -> Vec<u8> {
    bytes.truncate(len);
    bytes
}

#[test]
fn squashfs_single_partition() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "a.sqfs", &squashfs_image(8192, 4));

    let img = detector(&dir).init(&path, false).unwrap();
    assert_eq!(img.image_type, ImageType::Squashfs);
    assert_eq!(img.partitions.len(), 1);
    assert_eq!(img.partitions[0].name, ROOTFS_NAME);
    assert_eq!(img.partitions[0].offset, 0);
    assert_eq!(img.partitions[0].size, 8192);
    assert_eq!(img.usage, Usage::ROOTFS | Usage::OVERLAY | Usage::DATA);
}

#[test]
fn squashfs_v3_and_launch_stub() {
    let dir = tempfile::tempdir().unwrap();
    let v3 = write_image(dir.path(), "v3.sqfs", &squashfs_v3_image(4096));
    let stub = write_image(
        dir.path(),
        "stub.sqfs",
        &with_launch_stub(&squashfs_image(4096, 1)),
    );

    let det = detector(&dir);
    assert_eq!(det.init(&v3, false).unwrap().image_type, ImageType::Squashfs);
    let img = det.init(&stub, false).unwrap();
    assert_eq!(img.partitions[0].offset, 31);
    assert_eq!(img.partitions[0].size, 4096);
}

#[test]
fn squashfs_is_always_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "a.sqfs", &squashfs_image(4096, 1));

    let img = detector(&dir).init(&path, true).unwrap();
    assert_eq!(img.image_type, ImageType::Squashfs);
    assert!(!img.writable);
    assert!(img.check_writable().unwrap_err().is_read_only_filesystem());
}

#[test]
fn ext3_single_partition() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "a.ext3", &ext3_image(64 * 1024));

    let img = detector(&dir).init(&path, true).unwrap();
    assert_eq!(img.image_type, ImageType::Ext3);
    assert!(img.writable);
    assert!(img.check_writable().is_ok());
    assert_eq!(img.partitions.len(), 1);
    assert_eq!(img.partitions[0].size, 64 * 1024);
}

#[test]
fn corrupted_images_are_hard_errors() {
    let dir = tempfile::tempdir().unwrap();
    let det = detector(&dir);

    let short_sqfs = write_image(dir.path(), "s", &truncated(squashfs_image(8192, 1), 4096));
    let err = det.init(&short_sqfs, false).unwrap_err();
    assert!(matches!(err, CarapaceError::InvalidImage { format: "squashfs", .. }));

    let short_ext3 = write_image(dir.path(), "e", &truncated(ext3_image(64 * 1024), 32 * 1024));
    let err = det.init(&short_ext3, false).unwrap_err();
    assert!(matches!(err, CarapaceError::InvalidImage { format: "ext3", .. }));

    let mut no_journal = ext3_image(64 * 1024);
    no_journal[1116..1120].copy_from_slice(&0u32.to_le_bytes());
    let no_journal = write_image(dir.path(), "j", &no_journal);
    assert!(det.init(&no_journal, false).is_err());

    let bad_compression = write_image(dir.path(), "c", &squashfs_image(4096, 9));
    assert!(det.init(&bad_compression, false).is_err());
}

#[test]
fn sif_partitions_and_sections() {
    let dir = tempfile::tempdir().unwrap();
    let sif = SifBuilder::new("amd64")
        .primary(FsType::Squash, squashfs_image(4096, 1))
        .partition("data", 1, FsType::Ext3, PartType::Data, ext3_image(64 * 1024))
        .partition("upper", 1, FsType::Ext3, PartType::Overlay, ext3_image(64 * 1024))
        .partition("foreign", 2, FsType::Ext3, PartType::Overlay, ext3_image(64 * 1024))
        .object(DataType::GenericJson, "labels.json", br#"{"a":"b"}"#.to_vec())
        .build();
    let path = write_image(dir.path(), "c.sif", &sif);

    let img = detector(&dir).init(&path, false).unwrap();
    assert_eq!(img.image_type, ImageType::Sif);

    let names: Vec<_> = img.partitions.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, [ROOTFS_NAME, "data", "upper"]);
    assert_eq!(img.rootfs_partition().unwrap().fs_type(), Some(ImageType::Squashfs));
    assert_eq!(img.overlay_partitions().unwrap()[0].name, "upper");
    assert_eq!(img.data_partitions().unwrap()[0].name, "data");
    assert!(img.partitions[0].offset >= 4096);

    assert_eq!(img.sections.len(), 1);
    let mut json = String::new();
    section_reader(&img, Some("labels.json"), None)
        .unwrap()
        .read_to_string(&mut json)
        .unwrap();
    assert_eq!(json, r#"{"a":"b"}"#);
}

#[test]
fn sif_incompatible_arch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let sif = SifBuilder::new("s390x")
        .primary(FsType::Squash, squashfs_image(4096, 1))
        .build();
    let path = write_image(dir.path(), "s390x.sif", &sif);

    let err = detector(&dir).init(&path, false).unwrap_err();
    assert!(matches!(err, CarapaceError::IncompatibleArch { ref image, .. } if image == "s390x"));
}

#[test]
fn sif_corrupt_primary_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let sif = SifBuilder::new("amd64")
        .primary(FsType::Squash, vec![0u8; 4096])
        .build();
    let path = write_image(dir.path(), "bad.sif", &sif);

    let err = detector(&dir).init(&path, false).unwrap_err();
    assert!(matches!(err, CarapaceError::InvalidImage { format: "sif", .. }));
}

#[test_log::test]
fn sif_corrupt_overlay_follows_policy() {
    let dir = tempfile::tempdir().unwrap();
    let sif = SifBuilder::new("amd64")
        .primary(FsType::Squash, squashfs_image(4096, 1))
        .partition("upper", 1, FsType::Ext3, PartType::Overlay, vec![0u8; 4096])
        .build();
    let path = write_image(dir.path(), "overlay.sif", &sif);

    let err = detector(&dir).init(&path, false).unwrap_err();
    assert!(err.to_string().contains("upper"));

    let img = detector(&dir)
        .with_partition_policy(PartitionPolicy::Drop)
        .init(&path, false)
        .unwrap();
    assert_eq!(img.partitions.len(), 1);
    assert!(!img.has_usage(Usage::OVERLAY));
}

#[test]
fn sif_truncated_descriptor_table_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let sif = SifBuilder::new("amd64")
        .primary(FsType::Squash, squashfs_image(4096, 1))
        .build();
    let path = write_image(dir.path(), "short.sif", &truncated(sif, 300));

    let err = detector(&dir).init(&path, false).unwrap_err();
    assert!(matches!(err, CarapaceError::InvalidImage { format: "sif", .. }));
}

#[test]
fn writable_sif_locks_ext3_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let sif = SifBuilder::new("amd64")
        .primary(FsType::Squash, squashfs_image(4096, 1))
        .partition("upper", 1, FsType::Ext3, PartType::Overlay, ext3_image(64 * 1024))
        .build();
    let path = write_image(dir.path(), "rw.sif", &sif);
    let det = detector(&dir);

    let writer = det.init(&path, true).unwrap();
    let err = det.init(&path, false).unwrap_err();
    assert!(matches!(
        err,
        CarapaceError::LockConflict {
            requested: LockDirection::Reading,
            held: LockDirection::Writing,
            holder: LockHolder::ThisProcess,
            ..
        }
    ));

    drop(writer);
    assert!(det.init(&path, false).is_ok());
}

#[test]
fn read_only_images_share_locks() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "a.ext3", &ext3_image(64 * 1024));
    let det = detector(&dir);

    let first = det.init(&path, false).unwrap();
    let second = det.init(&path, false).unwrap();
    assert_eq!(first.path, second.path);
    assert!(det.init(&path, true).unwrap_err().is_lock_conflict());
}

#[test]
fn second_writer_in_same_process_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "rw.ext3", &ext3_image(64 * 1024));
    let det = detector(&dir);

    let _writer = det.init(&path, true).unwrap();
    let err = det.init(&path, true).unwrap_err();
    assert!(matches!(
        err,
        CarapaceError::LockConflict {
            requested: LockDirection::Writing,
            held: LockDirection::Writing,
            holder: LockHolder::ThisProcess,
            ..
        }
    ));
}

#[test]
fn lock_unknown_to_registry_is_another_holder() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "shared.ext3", &ext3_image(64 * 1024));

    let _writer = detector(&dir).init(&path, true).unwrap();
    let err = detector(&dir).init(&path, false).unwrap_err();
    assert!(matches!(
        err,
        CarapaceError::LockConflict {
            requested: LockDirection::Reading,
            held: LockDirection::Writing,
            holder: LockHolder::OtherProcess,
            ..
        }
    ));
}

#[test]
fn sif_overlay_without_primary_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let sif = SifBuilder::new("amd64")
        .partition("upper", 3, FsType::Ext3, PartType::Overlay, ext3_image(64 * 1024))
        .build();
    let path = write_image(dir.path(), "overlay-only.sif", &sif);

    let img = detector(&dir).init(&path, false).unwrap();
    assert_eq!(img.partitions.len(), 1);
    assert_eq!(img.partitions[0].name, "upper");
    assert_eq!(img.partitions[0].allowed_usage, Usage::OVERLAY);
    assert_eq!(img.usage, Usage::OVERLAY);
    assert!(img.rootfs_partition().unwrap_err().to_string().contains("no partition"));
}
