//! # carapace-common
//!
//! Shared types for the Carapace filesystem assembly crates:
//! - The common error enum and its taxonomy predicates
//! - Standard paths for sessions and host lookups

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{CarapaceError, CarapaceResult, LockDirection, LockHolder};
pub use paths::CarapacePaths;
