//! Mount flags and their option-string spelling.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Kernel `MS_*` mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MountFlags: u64 {
        /// Read-only.
        const RDONLY = libc::MS_RDONLY as u64;
        /// Ignore set-user-ID and set-group-ID bits.
        const NOSUID = libc::MS_NOSUID as u64;
        /// Disallow device files.
        const NODEV = libc::MS_NODEV as u64;
        /// Disallow program execution.
        const NOEXEC = libc::MS_NOEXEC as u64;
        /// Synchronous writes.
        const SYNCHRONOUS = libc::MS_SYNCHRONOUS as u64;
        /// Change flags of an existing mount.
        const REMOUNT = libc::MS_REMOUNT as u64;
        /// Mandatory locking.
        const MANDLOCK = libc::MS_MANDLOCK as u64;
        /// Synchronous directory updates.
        const DIRSYNC = libc::MS_DIRSYNC as u64;
        /// Do not update access times.
        const NOATIME = libc::MS_NOATIME as u64;
        /// Do not update directory access times.
        const NODIRATIME = libc::MS_NODIRATIME as u64;
        /// Bind mount.
        const BIND = libc::MS_BIND as u64;
        /// Apply recursively.
        const REC = libc::MS_REC as u64;
        /// Suppress kernel warnings.
        const SILENT = libc::MS_SILENT as u64;
        /// POSIX ACLs.
        const POSIXACL = libc::MS_POSIXACL as u64;
        /// Unbindable propagation.
        const UNBINDABLE = libc::MS_UNBINDABLE as u64;
        /// Private propagation.
        const PRIVATE = libc::MS_PRIVATE as u64;
        /// Slave propagation.
        const SLAVE = libc::MS_SLAVE as u64;
        /// Shared propagation.
        const SHARED = libc::MS_SHARED as u64;
        /// Relative access time updates.
        const RELATIME = libc::MS_RELATIME as u64;
        /// Always update access times.
        const STRICTATIME = libc::MS_STRICTATIME as u64;
        /// Lazy timestamp updates.
        const LAZYTIME = libc::MS_LAZYTIME as u64;
    }
}

/// Option names and the flags they set, most specific first.
const OPTIONS: &[(&str, MountFlags)] = &[
    ("rbind", MountFlags::BIND.union(MountFlags::REC)),
    ("rprivate", MountFlags::PRIVATE.union(MountFlags::REC)),
    ("rshared", MountFlags::SHARED.union(MountFlags::REC)),
    ("rslave", MountFlags::SLAVE.union(MountFlags::REC)),
    ("runbindable", MountFlags::UNBINDABLE.union(MountFlags::REC)),
    ("bind", MountFlags::BIND),
    ("remount", MountFlags::REMOUNT),
    ("ro", MountFlags::RDONLY),
    ("nosuid", MountFlags::NOSUID),
    ("nodev", MountFlags::NODEV),
    ("noexec", MountFlags::NOEXEC),
    ("sync", MountFlags::SYNCHRONOUS),
    ("dirsync", MountFlags::DIRSYNC),
    ("mand", MountFlags::MANDLOCK),
    ("noatime", MountFlags::NOATIME),
    ("nodiratime", MountFlags::NODIRATIME),
    ("relatime", MountFlags::RELATIME),
    ("strictatime", MountFlags::STRICTATIME),
    ("silent", MountFlags::SILENT),
    ("acl", MountFlags::POSIXACL),
    ("lazytime", MountFlags::LAZYTIME),
    ("private", MountFlags::PRIVATE),
    ("shared", MountFlags::SHARED),
    ("slave", MountFlags::SLAVE),
    ("unbindable", MountFlags::UNBINDABLE),
];

/// Options that clear flags.
const NEGATIONS: &[(&str, MountFlags)] = &[
    ("rw", MountFlags::RDONLY),
    ("suid", MountFlags::NOSUID),
    ("dev", MountFlags::NODEV),
    ("exec", MountFlags::NOEXEC),
    ("async", MountFlags::SYNCHRONOUS),
    ("nomand", MountFlags::MANDLOCK),
    ("atime", MountFlags::NOATIME),
    ("diratime", MountFlags::NODIRATIME),
    ("norelatime", MountFlags::RELATIME),
    ("nostrictatime", MountFlags::STRICTATIME),
    ("loud", MountFlags::SILENT),
    ("noacl", MountFlags::POSIXACL),
    ("nolazytime", MountFlags::LAZYTIME),
    (
        "defaults",
        MountFlags::RDONLY
            .union(MountFlags::NOSUID)
            .union(MountFlags::NODEV)
            .union(MountFlags::NOEXEC)
            .union(MountFlags::SYNCHRONOUS),
    ),
];

impl MountFlags {
    /// Flags that only make sense for bind mounts and remounts.
    pub const BIND_LIKE: Self = Self::BIND.union(Self::REMOUNT).union(Self::REC);

    /// Propagation type flags.
    pub const PROPAGATION: Self = Self::PRIVATE
        .union(Self::SHARED)
        .union(Self::SLAVE)
        .union(Self::UNBINDABLE);

    /// Render as canonical option names.
    #[must_use]
    pub fn to_options(self) -> Vec<String> {
        let mut remaining = self;
        let mut out = Vec::new();
        for (name, bits) in OPTIONS {
            if remaining.contains(*bits) {
                out.push((*name).to_string());
                remaining.remove(*bits);
            }
        }
        out
    }

    /// Split option strings into flags and options passed to the filesystem.
    #[must_use]
    pub fn parse_options<S: AsRef<str>>(options: &[S]) -> (Self, Vec<String>) {
        let mut flags = Self::empty();
        let mut data = Vec::new();
        for opt in options {
            let opt = opt.as_ref();
            if let Some((_, bits)) = OPTIONS.iter().find(|(name, _)| *name == opt) {
                flags.insert(*bits);
            } else if let Some((_, bits)) = NEGATIONS.iter().find(|(name, _)| *name == opt) {
                flags.remove(*bits);
            } else if !opt.is_empty() {
                data.push(opt.to_string());
            }
        }
        (flags, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn recursive_bind_renders_as_rbind() {
        let flags = MountFlags::BIND | MountFlags::REC | MountFlags::NOSUID;
        assert_eq!(flags.to_options(), ["rbind", "nosuid"]);
    }

    #[test]
    fn rbind_with_private_keeps_both() {
        let flags = MountFlags::BIND | MountFlags::REC | MountFlags::PRIVATE;
        let opts = flags.to_options();
        assert_eq!(opts, ["rbind", "private"]);
        assert_eq!(MountFlags::parse_options(&opts).0, flags);
    }

    #[test]
    fn negations_clear_flags() {
        let (flags, data) = MountFlags::parse_options(&["ro", "nodev", "rw", "mode=0755"]);
        assert_eq!(flags, MountFlags::NODEV);
        assert_eq!(data, ["mode=0755"]);
    }

    fn any_flags() -> impl Strategy<Value = MountFlags> {
        proptest::sample::subsequence(OPTIONS.to_vec(), 0..=OPTIONS.len())
            .prop_map(|picked| picked.iter().fold(MountFlags::empty(), |acc, (_, f)| acc | *f))
    }

    proptest! {
        #[test]
        fn option_round_trip_is_lossless(flags in any_flags()) {
            let (parsed, data) = MountFlags::parse_options(&flags.to_options());
            prop_assert_eq!(parsed, flags);
            prop_assert!(data.is_empty());
        }
    }
}
