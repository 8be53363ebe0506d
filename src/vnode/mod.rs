//! In-memory vnodes: identity, counts, state flags and the counted handle
//! callers hold.
//!
//! Locking: `interlock` guards the counts, flags, free-list membership and
//! identity of one vnode. It is always taken before the free-list lock or the
//! directory, never after. `data` is the vnode lock proper; it guards the
//! driver payload and serializes state transitions (whoever sets `CHANGING`
//! or `XLOCK` holds it exclusively).

mod alloc;
mod cache;
mod drain;
mod freelist;
mod reclaim;
mod release;
mod release_worker;

pub use cache::VnodeCache;
pub use freelist::FreeListKind;
pub use release::ReleaseMode;

pub(crate) use alloc::Allocator;
pub(crate) use freelist::{FreeLists, FreeSlot};
pub(crate) use release::ReleaseOrigin;

use crate::driver::{FsDriver, Mount, MountId};
use crate::errors::VnodeError;
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Notify, RwLock, RwLockMappedWriteGuard, RwLockReadGuard, RwLockWriteGuard};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VnodeFlags: u32 {
        /// A state transition is in progress; wait for it to finish.
        const CHANGING = 0x01;
        /// The vnode is being reclaimed.
        const XLOCK = 0x02;
        /// Fully reclaimed. Terminal.
        const CLEAN = 0x04;
        /// Iteration placeholder, never cached or counted.
        const MARKER = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VType {
    #[default]
    Non,
    Reg,
    Dir,
    Blk,
    Chr,
    Lnk,
    Sock,
    Fifo,
    Bad,
}

impl VType {
    pub fn is_device(self) -> bool {
        matches!(self, VType::Blk | VType::Chr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevId {
    pub major: u32,
    pub minor: u32,
}

impl DevId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.major, self.minor)
    }
}

/// Directory key: owning mount plus the driver's opaque key bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub mount: MountId,
    pub key: Bytes,
}

impl CacheKey {
    pub fn new(mount: MountId, key: impl Into<Bytes>) -> Self {
        Self {
            mount,
            key: key.into(),
        }
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mount, hex::encode(&self.key))
    }
}

/// The file-system instance a vnode belongs to. Reclaimed vnodes are rebound
/// to `Dead`.
pub enum Owner<D: FsDriver> {
    Mount(Arc<Mount<D>>),
    Dead,
}

impl<D: FsDriver> Owner<D> {
    pub fn mount(&self) -> Option<&Arc<Mount<D>>> {
        match self {
            Owner::Mount(mount) => Some(mount),
            Owner::Dead => None,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Owner::Dead)
    }
}

impl<D: FsDriver> Clone for Owner<D> {
    fn clone(&self) -> Self {
        match self {
            Owner::Mount(mount) => Owner::Mount(Arc::clone(mount)),
            Owner::Dead => Owner::Dead,
        }
    }
}

impl<D: FsDriver> fmt::Debug for Owner<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Mount(mount) => write!(f, "Mount({})", mount.id()),
            Owner::Dead => write!(f, "Dead"),
        }
    }
}

pub(crate) struct VnodeState<D: FsDriver> {
    pub flags: VnodeFlags,
    pub hold: u32,
    pub list: Option<FreeSlot>,
    pub owner: Owner<D>,
    pub vtype: VType,
    pub rdev: Option<DevId>,
    /// Directory key while the vnode is indexed.
    pub key: Option<CacheKey>,
}

impl<D: FsDriver> VnodeState<D> {
    fn busy(&self) -> bool {
        self.flags.intersects(VnodeFlags::CHANGING | VnodeFlags::XLOCK)
    }
}

pub struct Vnode<D: FsDriver> {
    serial: u64,
    use_count: AtomicU32,
    pub(crate) interlock: Mutex<VnodeState<D>>,
    cv: Notify,
    pub(crate) data: RwLock<Option<D::Payload>>,
}

impl<D: FsDriver> Vnode<D> {
    pub(crate) fn new(serial: u64, owner: Owner<D>, flags: VnodeFlags, use_count: u32) -> Self {
        Self {
            serial,
            use_count: AtomicU32::new(use_count),
            interlock: Mutex::new(VnodeState {
                flags,
                hold: 0,
                list: None,
                owner,
                vtype: VType::Non,
                rdev: None,
                key: None,
            }),
            cv: Notify::new(),
            data: RwLock::new(None),
        }
    }

    /// Allocation serial number, unique within one cache.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn hold_count(&self) -> u32 {
        self.interlock.lock().hold
    }

    pub fn flags(&self) -> VnodeFlags {
        self.interlock.lock().flags
    }

    pub fn is_clean(&self) -> bool {
        self.flags().contains(VnodeFlags::CLEAN)
    }

    pub fn is_marker(&self) -> bool {
        self.flags().contains(VnodeFlags::MARKER)
    }

    pub fn vtype(&self) -> VType {
        self.interlock.lock().vtype
    }

    pub fn rdev(&self) -> Option<DevId> {
        self.interlock.lock().rdev
    }

    pub fn owner(&self) -> Owner<D> {
        self.interlock.lock().owner.clone()
    }

    /// Key the vnode is currently indexed by, if any.
    pub fn key(&self) -> Option<Bytes> {
        self.interlock.lock().key.as_ref().map(|k| k.key.clone())
    }

    /// Which free list the vnode sits on, if any.
    pub fn free_list(&self) -> Option<FreeListKind> {
        self.interlock.lock().list.map(|slot| slot.kind)
    }

    /// Report whether the vnode is dead: `NotFound` once reclaimed, `Busy`
    /// while a reclaim is running and `wait` is false. With `wait`, an
    /// in-progress reclaim is waited out first.
    pub async fn dead_check(&self, wait: bool) -> Result<(), VnodeError> {
        loop {
            let notified = {
                let st = self.interlock.lock();
                if st.flags.contains(VnodeFlags::CLEAN) {
                    return Err(VnodeError::NotFound);
                }
                if !st.flags.contains(VnodeFlags::XLOCK) {
                    return Ok(());
                }
                if !wait {
                    return Err(VnodeError::Busy);
                }
                self.cv.notified()
            };
            notified.await;
        }
    }

    /// Wait until no transition is in progress.
    pub(crate) async fn wait_stable(&self) {
        loop {
            let notified = {
                let st = self.interlock.lock();
                if !st.busy() {
                    return;
                }
                self.cv.notified()
            };
            notified.await;
        }
    }

    /// Wait out any transition, then mark one as started. Returns `false`
    /// without marking if the vnode is already clean. Callers hold `data`
    /// exclusively.
    pub(crate) async fn begin_change(&self) -> bool {
        loop {
            let notified = {
                let mut st = self.interlock.lock();
                if st.flags.contains(VnodeFlags::CLEAN) {
                    return false;
                }
                if !st.busy() {
                    st.flags.insert(VnodeFlags::CHANGING);
                    return true;
                }
                self.cv.notified()
            };
            notified.await;
        }
    }

    /// Set `XLOCK` if the caller's reference is the only one. Lookups that
    /// arrive afterwards wait without adding a reference.
    pub(crate) fn xlock_if_sole(&self) -> bool {
        let mut st = self.interlock.lock();
        let sole = self.use_count() == 1;
        if sole {
            st.flags.insert(VnodeFlags::XLOCK);
        }
        sole
    }

    pub(crate) fn end_change(&self) {
        self.interlock.lock().flags.remove(VnodeFlags::CHANGING);
        self.wakeup();
    }

    pub(crate) fn wakeup(&self) {
        self.cv.notify_waiters();
    }

    /// Duplicate an existing reference. The caller must already hold one.
    pub(crate) fn add_ref(&self) {
        let prev = self.use_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "add_ref on unreferenced vnode {}", self.serial);
    }

    /// Drop a reference without the interlock, if that cannot be the last
    /// one. A count above one cannot race a 0→1 or 1→0 transition, both of
    /// which happen under the interlock.
    pub(crate) fn try_release_fast(&self) -> bool {
        let mut count = self.use_count.load(Ordering::Acquire);
        loop {
            if count <= 1 {
                return false;
            }
            match self.use_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    pub(crate) fn set_use_count(&self, count: u32) {
        self.use_count.store(count, Ordering::Release);
    }
}

impl<D: FsDriver> fmt::Debug for Vnode<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Vnode");
        dbg.field("serial", &self.serial)
            .field("use", &self.use_count());
        match self.interlock.try_lock() {
            Some(st) => dbg
                .field("hold", &st.hold)
                .field("flags", &st.flags)
                .field("vtype", &st.vtype)
                .field("owner", &st.owner)
                .field("list", &st.list.map(|slot| slot.kind))
                .field("key", &st.key)
                .finish(),
            None => dbg.finish_non_exhaustive(),
        }
    }
}

/// A counted reference to a vnode.
///
/// Cloning takes another reference. Dropping releases it in asynchronous
/// mode: if it was the last one, deactivation is handed to the deferred
/// release worker. Use [`VnodeRef::release`] to run it inline instead.
pub struct VnodeRef<D: FsDriver> {
    cache: Arc<VnodeCache<D>>,
    vnode: Arc<Vnode<D>>,
    released: bool,
}

impl<D: FsDriver> VnodeRef<D> {
    /// Wrap a reference the caller has already counted.
    pub(crate) fn from_counted(cache: &Arc<VnodeCache<D>>, vnode: Arc<Vnode<D>>) -> Self {
        Self {
            cache: Arc::clone(cache),
            vnode,
            released: false,
        }
    }

    pub fn vnode(&self) -> &Arc<Vnode<D>> {
        &self.vnode
    }

    pub fn cache(&self) -> &Arc<VnodeCache<D>> {
        &self.cache
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.vnode, &other.vnode)
    }

    fn into_parts(mut self) -> (Arc<VnodeCache<D>>, Arc<Vnode<D>>) {
        self.released = true;
        (Arc::clone(&self.cache), Arc::clone(&self.vnode))
    }

    /// Drop the reference, running deactivation inline if it was the last.
    pub async fn release(self) {
        let (cache, vnode) = self.into_parts();
        cache
            .vrele(vnode, ReleaseMode::Sync, ReleaseOrigin::Caller)
            .await;
    }

    /// Drop the reference from a context that must not block; any
    /// deactivation work is deferred.
    pub fn release_nonblocking(self) {
        let (cache, vnode) = self.into_parts();
        cache.vrele_prologue(vnode, ReleaseMode::AsyncPreferred, ReleaseOrigin::NoBlock);
    }

    /// Shared access to the driver payload. Fails once the vnode is dead.
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, D::Payload>, VnodeError> {
        let guard = self.vnode.data.read().await;
        RwLockReadGuard::try_map(guard, |data| data.as_ref()).map_err(|_| VnodeError::NotFound)
    }

    /// Exclusive access to the driver payload. Fails once the vnode is dead.
    pub async fn write(&self) -> Result<RwLockMappedWriteGuard<'_, D::Payload>, VnodeError> {
        let guard = self.vnode.data.write().await;
        RwLockWriteGuard::try_map(guard, |data| data.as_mut()).map_err(|_| VnodeError::NotFound)
    }

    pub fn try_write(&self) -> Result<RwLockMappedWriteGuard<'_, D::Payload>, VnodeError> {
        let guard = self.vnode.data.try_write().map_err(|_| VnodeError::Busy)?;
        RwLockWriteGuard::try_map(guard, |data| data.as_mut()).map_err(|_| VnodeError::NotFound)
    }
}

impl<D: FsDriver> Deref for VnodeRef<D> {
    type Target = Vnode<D>;

    fn deref(&self) -> &Vnode<D> {
        &self.vnode
    }
}

impl<D: FsDriver> Clone for VnodeRef<D> {
    fn clone(&self) -> Self {
        self.vnode.add_ref();
        Self {
            cache: Arc::clone(&self.cache),
            vnode: Arc::clone(&self.vnode),
            released: false,
        }
    }
}

impl<D: FsDriver> Drop for VnodeRef<D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cache.vrele_prologue(
            Arc::clone(&self.vnode),
            ReleaseMode::AsyncPreferred,
            ReleaseOrigin::Caller,
        );
    }
}

impl<D: FsDriver> fmt::Debug for VnodeRef<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.vnode.fmt(f)
    }
}
