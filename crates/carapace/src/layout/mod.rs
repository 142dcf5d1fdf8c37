//! Session layout and layers.

pub mod manager;
pub mod overlay;
pub mod session;

use carapace_common::CarapaceResult;

pub use manager::Manager;
pub use overlay::Overlay;
pub use session::Session;

/// A view stacked on top of the root filesystem.
pub trait Layer {
    /// Stage what the layer needs inside the session.
    fn add(&mut self, session: &mut Session) -> CarapaceResult<()>;

    /// Staged directory the layer is mounted on.
    fn dir(&self) -> &str;
}
