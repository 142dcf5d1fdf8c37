//! Performing a planned mount.

use std::ffi::CString;
use std::path::Path;

use carapace_common::{CarapaceError, CarapaceResult};
use rustix::mount::{MountFlags as RawFlags, MountPropagationFlags, mount, mount_change};

use super::MountPoint;
use super::flags::MountFlags;

/// Options interpreted by the executor and never passed to the kernel.
const INTERNAL_PREFIXES: &[&str] = &["offset=", "sizelimit="];

fn c_string(what: &str, value: &str) -> CarapaceResult<CString> {
    CString::new(value)
        .map_err(|_| CarapaceError::mount(format!("invalid {what} {value:?} (contains null byte)")))
}

fn raw(flags: MountFlags) -> RawFlags {
    #[allow(clippy::cast_possible_truncation)]
    RawFlags::from_bits_retain(flags.bits() as _)
}

/// Perform a single mount point.
///
/// Image mounts need a loop device set up by the caller, who passes the
/// loop device as the source.
pub fn apply(point: &MountPoint) -> CarapaceResult<()> {
    let (flags, data) = MountFlags::parse_options(&point.options);
    let data: Vec<&str> = data
        .iter()
        .map(String::as_str)
        .filter(|o| !INTERNAL_PREFIXES.iter().any(|p| o.starts_with(p)))
        .collect();
    let data = c_string("mount options", &data.join(","))?;
    let fs_type = c_string("filesystem type", &point.fs_type)?;
    let target = Path::new(&point.destination);
    let source = if point.source.is_empty() {
        "none"
    } else {
        point.source.as_str()
    };

    tracing::debug!(
        source,
        target = %target.display(),
        fs_type = %point.fs_type,
        ?flags,
        "Mounting"
    );

    let propagation = flags & (MountFlags::PROPAGATION | MountFlags::REC);
    let base = flags - MountFlags::PROPAGATION;

    if flags.contains(MountFlags::BIND) && !flags.contains(MountFlags::REMOUNT) {
        // The kernel ignores other flags on the initial bind.
        mount(source, target, fs_type.as_c_str(), raw(base & MountFlags::BIND_LIKE), Some(data.as_c_str()))
            .map_err(|e| CarapaceError::Io(e.into()))?;
        let rest = base - MountFlags::BIND_LIKE;
        if !rest.is_empty() {
            mount(
                source,
                target,
                fs_type.as_c_str(),
                raw(rest | MountFlags::BIND | MountFlags::REMOUNT),
                Some(data.as_c_str()),
            )
            .map_err(|e| CarapaceError::Io(e.into()))?;
        }
    } else if !(base - MountFlags::REC).is_empty() || !point.fs_type.is_empty() {
        mount(source, target, fs_type.as_c_str(), raw(base), Some(data.as_c_str()))
            .map_err(|e| CarapaceError::Io(e.into()))?;
    }

    if propagation.intersects(MountFlags::PROPAGATION) {
        #[allow(clippy::cast_possible_truncation)]
        let change = MountPropagationFlags::from_bits_retain(propagation.bits() as _);
        mount_change(target, change).map_err(|e| CarapaceError::Io(e.into()))?;
    }

    tracing::debug!(target = %target.display(), "Mounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_bytes_are_rejected_before_mounting() {
        let point = MountPoint {
            source: "tmpfs".into(),
            destination: "/nonexistent/carapace-test".into(),
            fs_type: "tmp\0fs".into(),
            options: Vec::new(),
        };
        let err = apply(&point).unwrap_err();
        assert!(err.to_string().contains("null byte"));
    }
}
