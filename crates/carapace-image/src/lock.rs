#![allow(unsafe_code)]
//! Byte-range locking of image sections.
//!
//! Sections are protected with non-blocking advisory `fcntl` locks: shared
//! for read-only images, exclusive for writable ones. Open file description
//! locks are preferred and classic process-associated locks are used on
//! kernels without them.
//!
//! Advisory locks held by a process never conflict with each other when they
//! are process-associated, so the registry also records every range it
//! locked. A request whose range is already held in the opposite mode by
//! this process fails before the kernel is asked.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use carapace_common::{CarapaceError, CarapaceResult, LockDirection, LockHolder};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::image::{HeldLock, Image, Section};

static GLOBAL: Lazy<Arc<LockRegistry>> = Lazy::new(|| Arc::new(LockRegistry::new()));

/// Process-wide record of locked image sections, keyed by image path.
#[derive(Debug, Default)]
pub struct LockRegistry {
    read: Mutex<HashMap<PathBuf, Vec<Section>>>,
    write: Mutex<HashMap<PathBuf, Vec<Section>>>,
}

impl LockRegistry {
    /// Create an empty registry. Tests use this to stay isolated.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    fn table(&self, direction: LockDirection) -> &Mutex<HashMap<PathBuf, Vec<Section>>> {
        match direction {
            LockDirection::Reading => &self.read,
            LockDirection::Writing => &self.write,
        }
    }

    /// Whether this process holds `section` of `path` in `direction`.
    #[must_use]
    pub fn is_held(&self, path: &Path, section: &Section, direction: LockDirection) -> bool {
        self.table(direction)
            .lock()
            .get(path)
            .is_some_and(|held| held.iter().any(|s| s.same_range(section)))
    }

    /// Whether this process holds any range of `path` overlapping
    /// `section` in `direction`.
    fn overlaps(&self, path: &Path, section: &Section, direction: LockDirection) -> bool {
        let end = section.offset.saturating_add(section.size);
        self.table(direction).lock().get(path).is_some_and(|held| {
            held.iter()
                .any(|s| s.offset < end && section.offset < s.offset.saturating_add(s.size))
        })
    }

    fn record(&self, path: &Path, section: &Section, direction: LockDirection) {
        self.table(direction)
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push(section.clone());
    }

    pub(crate) fn release(&self, path: &Path, section: &Section, direction: LockDirection) {
        let mut table = self.table(direction).lock();
        if let Some(held) = table.get_mut(path) {
            if let Some(pos) = held.iter().position(|s| s.same_range(section)) {
                held.remove(pos);
            }
            if held.is_empty() {
                table.remove(path);
            }
        }
    }

    /// Lock a section of an opened image, shared when the image is read-only
    /// and exclusive when it is writable.
    ///
    /// Filesystems without lock support are tolerated with a warning.
    pub fn lock_section(self: &Arc<Self>, image: &mut Image, section: &Section) -> CarapaceResult<()> {
        let direction = if image.writable {
            LockDirection::Writing
        } else {
            LockDirection::Reading
        };

        // Only a write lock excludes another lock in the same direction.
        let held_here = [direction.opposite(), LockDirection::Writing]
            .into_iter()
            .find(|&held| self.is_held(&image.path, section, held));
        if let Some(held) = held_here {
            return Err(CarapaceError::LockConflict {
                path: image.path.clone(),
                requested: direction,
                held,
                holder: LockHolder::ThisProcess,
            });
        }

        match try_lock_range(image.file.as_fd(), direction, section.offset, section.size) {
            Ok(()) => {}
            Err(RangeLockError::Conflict(held)) => {
                let holder = if self.overlaps(&image.path, section, held) {
                    LockHolder::ThisProcess
                } else {
                    LockHolder::OtherProcess
                };
                return Err(CarapaceError::LockConflict {
                    path: image.path.clone(),
                    requested: direction,
                    held,
                    holder,
                });
            }
            Err(RangeLockError::Unsupported(err)) => {
                tracing::warn!(
                    path = %image.path.display(),
                    error = %err,
                    "Filesystem does not support locking, section left unlocked"
                );
                return Ok(());
            }
            Err(RangeLockError::Io(err)) => return Err(CarapaceError::Io(err)),
        }

        tracing::debug!(
            path = %image.path.display(),
            offset = section.offset,
            size = section.size,
            %direction,
            "Locked image section"
        );

        self.record(&image.path, section, direction);
        image.locks = Some(Arc::clone(self));
        image.held.push(HeldLock {
            section: section.clone(),
            direction,
        });
        Ok(())
    }
}

#[derive(Debug)]
enum RangeLockError {
    Conflict(LockDirection),
    Unsupported(io::Error),
    Io(io::Error),
}

fn flock_for(direction: LockDirection, offset: u64, size: u64) -> libc::flock {
    // Safety: flock is a plain C struct for which all-zero is a valid value.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match direction {
        LockDirection::Reading => libc::F_RDLCK as libc::c_short,
        LockDirection::Writing => libc::F_WRLCK as libc::c_short,
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = size as libc::off_t;
    fl
}

fn fcntl_lock(fd: BorrowedFd<'_>, cmd: libc::c_int, fl: &mut libc::flock) -> io::Result<()> {
    // Safety: fd is a valid borrowed descriptor and fl outlives the call.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), cmd, std::ptr::from_mut(fl)) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Set a non-blocking lock, preferring open file description locks.
fn try_lock_range(
    fd: BorrowedFd<'_>,
    direction: LockDirection,
    offset: u64,
    size: u64,
) -> Result<(), RangeLockError> {
    let mut fl = flock_for(direction, offset, size);
    match fcntl_lock(fd, libc::F_OFD_SETLK, &mut fl) {
        Ok(()) => Ok(()),
        // Kernels before 3.15 reject OFD commands.
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            let mut fl = flock_for(direction, offset, size);
            fcntl_lock(fd, libc::F_SETLK, &mut fl)
                .map_err(|e| classify(fd, e, direction, offset, size, libc::F_GETLK))
        }
        Err(e) => Err(classify(fd, e, direction, offset, size, libc::F_OFD_GETLK)),
    }
}

fn classify(
    fd: BorrowedFd<'_>,
    err: io::Error,
    direction: LockDirection,
    offset: u64,
    size: u64,
    getlk: libc::c_int,
) -> RangeLockError {
    match err.raw_os_error() {
        Some(libc::EAGAIN | libc::EACCES) => RangeLockError::Conflict(held_direction(
            fd, direction, offset, size, getlk,
        )),
        Some(libc::ENOLCK | libc::EOPNOTSUPP | libc::ENOSYS) => RangeLockError::Unsupported(err),
        _ => RangeLockError::Io(err),
    }
}

/// Ask the kernel which kind of lock blocks the request. Only an exclusive
/// lock can block a shared request.
fn held_direction(
    fd: BorrowedFd<'_>,
    requested: LockDirection,
    offset: u64,
    size: u64,
    getlk: libc::c_int,
) -> LockDirection {
    if requested == LockDirection::Reading {
        return LockDirection::Writing;
    }
    let mut fl = flock_for(requested, offset, size);
    match fcntl_lock(fd, getlk, &mut fl) {
        Ok(()) if fl.l_type == libc::F_RDLCK as libc::c_short => LockDirection::Reading,
        _ => LockDirection::Writing,
    }
}
