//! Common error types for the Carapace crates.

use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CarapaceError`].
pub type CarapaceResult<T> = Result<T, CarapaceError>;

/// Access direction of a byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDirection {
    /// Shared lock, image opened read-only.
    Reading,
    /// Exclusive lock, image opened writable.
    Writing,
}

impl LockDirection {
    /// The direction that conflicts with this one.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Reading => Self::Writing,
            Self::Writing => Self::Reading,
        }
    }
}

impl fmt::Display for LockDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reading => f.write_str("reading"),
            Self::Writing => f.write_str("writing"),
        }
    }
}

/// Who holds a conflicting lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockHolder {
    /// The current process. This is a caller bug.
    ThisProcess,
    /// Some other process. Legitimate contention.
    OtherProcess,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThisProcess => f.write_str("this process"),
            Self::OtherProcess => f.write_str("another process"),
        }
    }
}

/// Errors across the Carapace crates.
#[derive(Error, Diagnostic, Debug)]
pub enum CarapaceError {
    /// The candidate format does not claim this image. Only used internally
    /// by the detector to move on to the next format.
    #[error("not a {format} image: {reason}")]
    #[diagnostic(code(carapace::image::format_mismatch))]
    FormatMismatch {
        /// Format that rejected the image.
        format: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// No registered format recognized the image.
    #[error("image format not recognized: {}", path.display())]
    #[diagnostic(
        code(carapace::image::unknown_format),
        help("Supported formats are SIF, squashfs, ext3 and sandbox directories")
    )]
    UnknownFormat {
        /// Resolved image path.
        path: PathBuf,
    },

    /// The image claims a format but its content is malformed.
    #[error("invalid {format} image {}: {reason}", path.display())]
    #[diagnostic(code(carapace::image::invalid))]
    InvalidImage {
        /// Format being parsed.
        format: &'static str,
        /// Image path.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },

    /// The image targets an architecture the host cannot run.
    #[error("the image's architecture ({image}) could not run on the host's ({host})")]
    #[diagnostic(
        code(carapace::image::incompatible_arch),
        help("Register a persistent binfmt_misc emulator for the image architecture")
    )]
    IncompatibleArch {
        /// Image architecture.
        image: String,
        /// Host architecture.
        host: String,
    },

    /// The image format is inherently read-only but write access was requested.
    #[error("{} is a read-only filesystem image", path.display())]
    #[diagnostic(code(carapace::image::read_only))]
    ReadOnlyFilesystem {
        /// Image path.
        path: PathBuf,
    },

    /// A byte range of the image is locked in a conflicting mode.
    #[error("can't open {} for {requested}, currently in use for {held} by {holder}", path.display())]
    #[diagnostic(code(carapace::image::lock_conflict))]
    LockConflict {
        /// Image path.
        path: PathBuf,
        /// Requested direction.
        requested: LockDirection,
        /// Direction of the lock already held.
        held: LockDirection,
        /// Holder of the conflicting lock.
        holder: LockHolder,
    },

    /// No partition matched a name or index lookup.
    #[error("no partition found")]
    #[diagnostic(code(carapace::image::no_partition))]
    PartitionNotFound,

    /// No section matched a name or index lookup.
    #[error("no section found")]
    #[diagnostic(code(carapace::image::no_section))]
    SectionNotFound,

    /// Index lookup past the end of a partition or section list.
    #[error("index too large: {index} (have {len})")]
    #[diagnostic(code(carapace::image::index_too_large))]
    IndexTooLarge {
        /// Requested index.
        index: usize,
        /// Number of entries.
        len: usize,
    },

    /// Mount registry validation failed.
    #[error("mount error: {message}")]
    #[diagnostic(code(carapace::mount))]
    Mount {
        /// The error message.
        message: String,
    },

    /// Layout staging or materialization failed.
    #[error("layout error: {message}")]
    #[diagnostic(code(carapace::layout))]
    Layout {
        /// The error message.
        message: String,
    },

    /// Driver registration or lookup failed.
    #[error("driver error: {message}")]
    #[diagnostic(code(carapace::driver))]
    Driver {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(carapace::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(carapace::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(carapace::unsupported), help("This feature requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(carapace::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl CarapaceError {
    /// Shorthand for a [`CarapaceError::Mount`] error.
    pub fn mount(message: impl Into<String>) -> Self {
        Self::Mount {
            message: message.into(),
        }
    }

    /// Shorthand for a [`CarapaceError::Layout`] error.
    pub fn layout(message: impl Into<String>) -> Self {
        Self::Layout {
            message: message.into(),
        }
    }

    /// Shorthand for a [`CarapaceError::FormatMismatch`] error.
    pub fn mismatch(format: &'static str, reason: impl Into<String>) -> Self {
        Self::FormatMismatch {
            format,
            reason: reason.into(),
        }
    }

    /// Whether this only means "not my format".
    #[must_use]
    pub const fn is_format_mismatch(&self) -> bool {
        matches!(self, Self::FormatMismatch { .. })
    }

    /// Whether this signals an inherently read-only image.
    #[must_use]
    pub const fn is_read_only_filesystem(&self) -> bool {
        matches!(self, Self::ReadOnlyFilesystem { .. })
    }

    /// Whether this is a byte-range lock conflict.
    #[must_use]
    pub const fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }
}

impl From<serde_json::Error> for CarapaceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_conflict_display() {
        let err = CarapaceError::LockConflict {
            path: PathBuf::from("/images/alpine.sif"),
            requested: LockDirection::Reading,
            held: LockDirection::Writing,
            holder: LockHolder::ThisProcess,
        };
        insta::assert_snapshot!(
            err.to_string(),
            @"can't open /images/alpine.sif for reading, currently in use for writing by this process"
        );
        assert!(err.is_lock_conflict());
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CarapaceError = io_err.into();
        assert!(matches!(err, CarapaceError::Io(_)));
    }

    #[test]
    fn predicates() {
        assert!(CarapaceError::mismatch("ext3", "bad magic").is_format_mismatch());
        assert!(
            CarapaceError::ReadOnlyFilesystem {
                path: PathBuf::from("/x")
            }
            .is_read_only_filesystem()
        );
        assert!(!CarapaceError::PartitionNotFound.is_format_mismatch());
    }

    #[test]
    fn opposite_direction() {
        assert_eq!(LockDirection::Reading.opposite(), LockDirection::Writing);
        assert_eq!(LockDirection::Writing.opposite(), LockDirection::Reading);
    }
}
