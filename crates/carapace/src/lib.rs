//! # Carapace
//!
//! Carapace assembles container root filesystems from images.
//!
//! ## Features
//!
//! - **Image detection**: sandbox directories, SIF, squashfs and ext3, with byte-range locking
//! - **Mount planning**: a validated, tagged mount list handed to a privileged executor
//! - **Session layout**: staged directory trees materialized incrementally
//! - **Overlay layer**: placeholders for mount targets missing from the image
//!
//! ## Usage
//!
//! ```no_run
//! use carapace::config::AssemblyConfig;
//! use carapace::layout::{Overlay, Session};
//! use carapace::mount::{MountFlags, Tag};
//!
//! # fn example() -> carapace::CarapaceResult<()> {
//! let config = AssemblyConfig::default();
//! let image = config.detector().init("/images/alpine.sif", false)?;
//! let rootfs = image.rootfs_partition()?;
//!
//! let mut session = Session::new(config.paths.session("c1"))?;
//! let mut overlay = Overlay::new();
//! session.attach_layer(&mut overlay)?;
//!
//! let mut points = config.points();
//! let rootfs_path = session.rootfs_path()?.display().to_string();
//! points.add_image(
//!     &image.source.display().to_string(),
//!     &rootfs_path,
//!     rootfs.fs_type().map_or("squashfs", |t| t.as_str()),
//!     MountFlags::NOSUID | MountFlags::NODEV,
//!     rootfs.offset,
//!     rootfs.size,
//! )?;
//! points.tag(&rootfs_path, Tag::RootFs)?;
//! points.add_fs("/proc", "proc", MountFlags::NOSUID, &[])?;
//! points.tag("/proc", Tag::Kernel)?;
//!
//! let rootfs_dir = session.rootfs_path()?;
//! overlay.create_layer(&mut session, &rootfs_dir, &mut points)?;
//! println!("{}", points.plan().to_json()?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod driver;
pub mod layout;
pub mod mount;

pub use carapace_common::{CarapaceError, CarapaceResult};
pub use carapace_image as image;
pub use config::AssemblyConfig;
