//! The capability set a concrete file system provides to the vnode cache,
//! and the mount handle that owns one driver instance.

use crate::vnode::{DevId, VType, Vnode, VnodeRef};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

/// What a driver hands back when it resolves or creates an object.
#[derive(Debug)]
pub struct LoadedNode<P> {
    pub vtype: VType,
    pub payload: P,
    /// Canonical key the object is indexed by.
    pub key: Bytes,
    /// Device identity for `Chr`/`Blk` vnodes.
    pub rdev: Option<DevId>,
}

impl<P> LoadedNode<P> {
    pub fn new(vtype: VType, payload: P, key: impl Into<Bytes>) -> Self {
        Self {
            vtype,
            payload,
            key: key.into(),
            rdev: None,
        }
    }

    pub fn with_rdev(mut self, rdev: DevId) -> Self {
        self.rdev = Some(rdev);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
    /// Write dirty pages and buffers back, then drop them.
    Flush,
    /// Drop everything without writing; used when a flush cannot complete.
    Discard,
}

/// One concrete file-system type. A driver value is one file-system
/// instance; the core stores it inside a [`Mount`].
#[async_trait]
pub trait FsDriver: Send + Sync + Sized + 'static {
    /// Driver-private per-object state, never interpreted by the core.
    type Payload: Send + Sync + 'static;
    /// Attributes passed through to `create_new`.
    type Attributes: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resolve an existing object into an in-memory payload.
    async fn load_by_key(&self, key: &[u8]) -> Result<LoadedNode<Self::Payload>, Self::Error>;

    /// Allocate a new object and its identity key.
    async fn create_new(
        &self,
        parent: &VnodeRef<Self>,
        attrs: &Self::Attributes,
    ) -> Result<LoadedNode<Self::Payload>, Self::Error>;

    /// Called when the last reference goes away. Returns whether the object
    /// should be reclaimed now rather than parked.
    async fn deactivate(&self, vnode: &Vnode<Self>, payload: &mut Self::Payload) -> bool;

    /// Release the payload. Must not fail for an object the driver agreed to
    /// recycle.
    async fn reclaim(&self, vnode: &Vnode<Self>, payload: Self::Payload) -> Result<(), Self::Error>;

    /// Flush or discard cached pages and buffers of the object.
    async fn invalidate_cached_data(
        &self,
        vnode: &Vnode<Self>,
        payload: &mut Self::Payload,
        mode: InvalidateMode,
    ) -> Result<(), Self::Error>;

    /// Drop name-cache entries pointing at the object. Drivers without a
    /// name cache keep the default.
    fn purge_names(&self, _vnode: &Vnode<Self>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(Uuid);

impl MountId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mounted file-system instance.
pub struct Mount<D: FsDriver> {
    id: MountId,
    driver: D,
    busy: AtomicUsize,
    suspended: AtomicBool,
}

impl<D: FsDriver> Mount<D> {
    pub fn new(driver: D) -> Arc<Self> {
        Arc::new(Self {
            id: MountId::new(),
            driver,
            busy: AtomicUsize::new(0),
            suspended: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Stop accepting new loads and reclamation work.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Number of operations currently holding the mount busy.
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Mark the mount busy for the lifetime of the returned guard, unless it
    /// is suspended.
    pub(crate) fn try_busy(self: &Arc<Self>) -> Option<MountBusy<D>> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        if self.is_suspended() {
            self.busy.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(MountBusy {
            mount: Arc::clone(self),
        })
    }
}

impl<D: FsDriver> fmt::Debug for Mount<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("busy", &self.busy_count())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

pub(crate) struct MountBusy<D: FsDriver> {
    mount: Arc<Mount<D>>,
}

impl<D: FsDriver> Drop for MountBusy<D> {
    fn drop(&mut self) {
        self.mount.busy.fetch_sub(1, Ordering::SeqCst);
    }
}
