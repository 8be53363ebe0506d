pub mod config;
pub mod driver;
pub mod errors;
pub mod memfs;
pub mod stats;
pub mod task;
pub mod vnode;

#[cfg(feature = "failpoints")]
pub mod failpoints;

pub use driver::{FsDriver, InvalidateMode, LoadedNode, Mount, MountId};
pub use errors::VnodeError;
pub use vnode::{ReleaseMode, VnodeCache, VnodeRef};
