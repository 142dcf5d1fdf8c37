//! Mount drivers for filesystems the kernel can't mount directly.
//!
//! A driver is registered under a name and asked to perform mounts whose
//! filesystem it handles. It may fall back to the plain kernel mount.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use carapace_common::{CarapaceError, CarapaceResult};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::mount::{self, MountPoint};

bitflags! {
    /// What a driver can mount.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DriverFeatures: u32 {
        /// Image files such as squashfs or ext3.
        const IMAGE = 1 << 0;
        /// Overlay filesystems.
        const OVERLAY = 1 << 1;
        /// FUSE-based filesystems.
        const FUSE = 1 << 2;
    }
}

/// Kernel mount used when a driver declines to handle a mount itself.
pub type MountFn = fn(&MountPoint) -> CarapaceResult<()>;

/// Parameters given to a driver when the container starts.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Session directory.
    pub session_path: PathBuf,
    /// Features the caller intends to use.
    pub features: DriverFeatures,
}

/// A mount backend.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Features supported.
    fn features(&self) -> DriverFeatures;

    /// Perform `point`, optionally through `fallback`.
    fn mount(&self, point: &MountPoint, fallback: MountFn) -> CarapaceResult<()>;

    /// Start any helper the driver needs.
    fn start(&self, params: &StartParams) -> CarapaceResult<()>;

    /// Stop helpers started by [`Driver::start`].
    fn stop(&self) -> CarapaceResult<()>;
}

static GLOBAL: Lazy<Arc<DriverRegistry>> = Lazy::new(|| Arc::new(DriverRegistry::new()));

/// Name-keyed driver registry.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: RwLock<BTreeMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Register `driver` under `name`.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) -> CarapaceResult<()> {
        if name.is_empty() {
            return Err(CarapaceError::Driver {
                message: "driver name can't be empty".into(),
            });
        }
        let mut drivers = self.drivers.write();
        if drivers.contains_key(name) {
            return Err(CarapaceError::Driver {
                message: format!("driver {name} is already registered"),
            });
        }
        tracing::debug!(name, features = ?driver.features(), "Registered driver");
        drivers.insert(name.to_string(), driver);
        Ok(())
    }

    /// Driver registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.read().get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.drivers.read().keys().cloned().collect()
    }

    /// Mount `point` through the named driver, or directly when `name` is
    /// `None`.
    pub fn mount(&self, name: Option<&str>, point: &MountPoint) -> CarapaceResult<()> {
        let Some(name) = name else {
            return mount::apply(point);
        };
        let driver = self.get(name).ok_or_else(|| CarapaceError::Driver {
            message: format!("no driver named {name}"),
        })?;
        driver.mount(point, mount::apply)
    }
}
