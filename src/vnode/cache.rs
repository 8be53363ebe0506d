use super::drain::DrainWorker;
use super::release_worker::{ReleaseRequest, ReleaseWorker};
use super::{Allocator, CacheKey, DevId, FreeListKind, FreeLists, VType, Vnode, VnodeFlags, VnodeRef};
use crate::config::{DrainConfig, Settings};
use crate::driver::{FsDriver, LoadedNode, Mount};
use crate::errors::VnodeError;
use crate::stats::{StatsSnapshot, VnodeStats};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "failpoints")]
use crate::failpoints as fp;

/// One row of the hash directory.
///
/// `Loading` and `Moving` slots own a watch sender that is dropped when the
/// slot is replaced or removed; lookups that find one subscribe and wait for
/// the channel to close instead of polling.
pub(crate) enum Slot<D: FsDriver> {
    /// A load or create for this key is in flight.
    Loading(watch::Sender<()>),
    Live(Arc<Vnode<D>>),
    /// The vnode is being rekeyed away from this key.
    Moving {
        vnode: Arc<Vnode<D>>,
        done: watch::Sender<()>,
    },
}

impl<D: FsDriver> Slot<D> {
    fn pending() -> Self {
        Slot::Loading(watch::channel(()).0)
    }

    /// A `Loading` slot plus a receiver that identifies it later.
    fn loading() -> (Self, watch::Receiver<()>) {
        let (done, token) = watch::channel(());
        (Slot::Loading(done), token)
    }

    fn is_load(&self, token: &watch::Receiver<()>) -> bool {
        matches!(self, Slot::Loading(done) if token.same_channel(&done.subscribe()))
    }

    pub(crate) fn holds(&self, vnode: &Arc<Vnode<D>>) -> bool {
        match self {
            Slot::Live(v) | Slot::Moving { vnode: v, .. } => Arc::ptr_eq(v, vnode),
            Slot::Loading(_) => false,
        }
    }
}

enum Lookup<D: FsDriver> {
    Live(Arc<Vnode<D>>),
    Pending(watch::Receiver<()>),
    Absent,
}

/// Tears down a vnode that never made it into the directory, including
/// when the future driving the load is dropped.
struct PendingVnode<'a, D: FsDriver> {
    cache: &'a VnodeCache<D>,
    vnode: Option<Arc<Vnode<D>>>,
    slot: Option<(CacheKey, watch::Receiver<()>)>,
}

impl<D: FsDriver> PendingVnode<'_, D> {
    fn vnode(&self) -> &Arc<Vnode<D>> {
        match &self.vnode {
            Some(vnode) => vnode,
            None => unreachable!("pending vnode already published"),
        }
    }

    fn publish(mut self) -> Arc<Vnode<D>> {
        self.slot = None;
        match self.vnode.take() {
            Some(vnode) => vnode,
            None => unreachable!("pending vnode already published"),
        }
    }
}

impl<D: FsDriver> Drop for PendingVnode<'_, D> {
    fn drop(&mut self) {
        if let Some((key, token)) = self.slot.take() {
            self.cache.directory.remove_if(&key, |_, slot| slot.is_load(&token));
        }
        if let Some(vnode) = self.vnode.take() {
            self.cache.discard(vnode);
        }
    }
}

/// The vnode cache: hash directory, free lists, allocator and the two
/// background workers, for one driver type.
///
/// Constructed with [`VnodeCache::new`]; [`VnodeCache::start`] spawns the
/// deferred release and drain workers and [`VnodeCache::shutdown`] stops
/// them. The workers keep the cache alive until shut down.
pub struct VnodeCache<D: FsDriver> {
    pub(crate) directory: DashMap<CacheKey, Slot<D>>,
    pub(crate) freelists: FreeLists<D>,
    pub(crate) alloc: Allocator,
    pub(crate) stats: VnodeStats,
    /// Victims taken off the free lists and not yet released again.
    pub(crate) cleaning: AtomicUsize,
    pub(crate) cleaned: Notify,
    drain_config: DrainConfig,
    pub(crate) release_tx: mpsc::UnboundedSender<ReleaseRequest<D>>,
    release_rx: Mutex<Option<mpsc::UnboundedReceiver<ReleaseRequest<D>>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: FsDriver> VnodeCache<D> {
    pub fn new(settings: &Settings) -> Arc<Self> {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            directory: DashMap::new(),
            freelists: FreeLists::new(),
            alloc: Allocator::new(settings.cache.desired_vnodes),
            stats: VnodeStats::default(),
            cleaning: AtomicUsize::new(0),
            cleaned: Notify::new(),
            drain_config: settings.drain.clone(),
            release_tx,
            release_rx: Mutex::new(Some(release_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the deferred release worker and the drain worker. Must be
    /// called from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(release_rx) = self.release_rx.lock().take() else {
            warn!("vnode cache workers already started");
            return;
        };
        let release = ReleaseWorker::new(Arc::clone(self)).spawn(release_rx, self.shutdown.clone());
        let drain = DrainWorker::new(Arc::clone(self), &self.drain_config).spawn(self.shutdown.clone());
        self.tasks.lock().extend([release, drain]);
        info!(
            "Vnode cache started: desired={}, drain interval={}ms",
            self.alloc.desired(),
            self.drain_config.interval_ms
        );
    }

    /// Stop both workers. Releases still queued are processed first.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Vnode cache worker ended abnormally: {}", e);
            }
        }
        info!("Vnode cache stopped");
    }

    /// Live vnodes, markers excluded.
    pub fn numvnodes(&self) -> usize {
        self.alloc.numvnodes()
    }

    pub fn desired_vnodes(&self) -> usize {
        self.alloc.desired()
    }

    /// Number of directory rows, including in-flight loads.
    pub fn cached(&self) -> usize {
        self.directory.len()
    }

    pub fn free_count(&self, kind: FreeListKind) -> usize {
        self.freelists.len(kind)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.numvnodes = self.numvnodes() as u64;
        snapshot.desired_vnodes = self.desired_vnodes() as u64;
        snapshot.free_no_hold = self.free_count(FreeListKind::NoHold) as u64;
        snapshot.free_hold = self.free_count(FreeListKind::Hold) as u64;
        snapshot.cached = self.cached() as u64;
        snapshot
    }

    /// Look up the vnode for `key`, loading it through the driver if it is
    /// not cached. Concurrent callers for the same key share one load.
    pub async fn get(self: &Arc<Self>, mount: &Arc<Mount<D>>, key: &[u8]) -> Result<VnodeRef<D>, VnodeError> {
        self.lookup(mount, key, true).await
    }

    /// Like [`get`](Self::get), but returns `Busy` instead of waiting for an
    /// in-flight load or state transition.
    pub async fn get_nowait(self: &Arc<Self>, mount: &Arc<Mount<D>>, key: &[u8]) -> Result<VnodeRef<D>, VnodeError> {
        self.lookup(mount, key, false).await
    }

    fn probe(&self, key: &CacheKey) -> Lookup<D> {
        match self.directory.get(key) {
            Some(slot) => match slot.value() {
                Slot::Live(vnode) => Lookup::Live(Arc::clone(vnode)),
                Slot::Loading(done) | Slot::Moving { done, .. } => Lookup::Pending(done.subscribe()),
            },
            None => Lookup::Absent,
        }
    }

    async fn lookup(self: &Arc<Self>, mount: &Arc<Mount<D>>, key: &[u8], wait: bool) -> Result<VnodeRef<D>, VnodeError> {
        let ckey = CacheKey::new(mount.id(), Bytes::copy_from_slice(key));

        loop {
            match self.probe(&ckey) {
                Lookup::Live(vnode) => {
                    let handle = self.vget(&vnode, wait).await?;
                    VnodeStats::bump(&self.stats.cache_hits);
                    return Ok(handle);
                }
                Lookup::Pending(mut done) => {
                    if !wait {
                        return Err(VnodeError::Busy);
                    }
                    // closes when the slot is filled or dropped
                    let _ = done.changed().await;
                    continue;
                }
                Lookup::Absent => {}
            }

            let Some(_busy) = mount.try_busy() else {
                return Err(VnodeError::Busy);
            };
            let mut pending = PendingVnode {
                cache: self,
                vnode: Some(self.alloc.alloc(mount)),
                slot: None,
            };
            VnodeStats::bump(&self.stats.allocated);
            pending.vnode().interlock.lock().flags.insert(VnodeFlags::CHANGING);

            let token = match self.directory.entry(ckey.clone()) {
                Entry::Occupied(_) => None,
                Entry::Vacant(entry) => {
                    let (slot, token) = Slot::loading();
                    entry.insert(slot);
                    Some(token)
                }
            };
            let Some(token) = token else {
                debug!(key = ?ckey, "lost load race, retrying");
                continue;
            };
            pending.slot = Some((ckey.clone(), token.clone()));

            VnodeStats::bump(&self.stats.loads);
            let node = match self.load_node(mount, key).await {
                Ok(node) => node,
                Err(err) => {
                    VnodeStats::bump(&self.stats.load_failures);
                    debug!(key = ?ckey, "load failed: {}", err);
                    return Err(err);
                }
            };
            if node.key.as_ref() != key {
                panic!(
                    "driver loaded {:?} under canonical key {}",
                    ckey,
                    hex::encode(&node.key)
                );
            }

            let vnode = Arc::clone(pending.vnode());
            self.install(&vnode, node, ckey.clone()).await;
            // replacing the slot drops its sender and wakes waiters
            let published = match self.directory.get_mut(&ckey) {
                Some(mut slot) if slot.is_load(&token) => {
                    *slot = Slot::Live(Arc::clone(&vnode));
                    true
                }
                _ => false,
            };
            if !published {
                // the row was removed mid-load and may belong to another loader
                debug!(key = ?ckey, "load slot removed, dropping loaded vnode");
                pending.slot = None;
                self.abandon_load(mount, &vnode).await;
                continue;
            }
            pending.publish();
            vnode.end_change();
            debug!(serial = vnode.serial(), key = ?ckey, "vnode loaded");
            return Ok(VnodeRef::from_counted(self, vnode));
        }
    }

    async fn load_node(&self, mount: &Mount<D>, key: &[u8]) -> Result<LoadedNode<D::Payload>, VnodeError> {
        #[cfg(feature = "failpoints")]
        fp::fail_point!(fp::LOAD_BEFORE_DRIVER, |_| Err(VnodeError::driver(
            std::io::Error::other("injected load failure")
        )));

        let node = mount
            .driver()
            .load_by_key(key)
            .await
            .map_err(VnodeError::driver)?;

        #[cfg(feature = "failpoints")]
        fp::fail_point!(fp::LOAD_AFTER_DRIVER, |_| Err(VnodeError::driver(
            std::io::Error::other("injected post-load failure")
        )));

        Ok(node)
    }

    async fn create_node(
        &self,
        mount: &Mount<D>,
        parent: &VnodeRef<D>,
        attrs: &D::Attributes,
    ) -> Result<LoadedNode<D::Payload>, VnodeError> {
        #[cfg(feature = "failpoints")]
        fp::fail_point!(fp::CREATE_BEFORE_DRIVER, |_| Err(VnodeError::driver(
            std::io::Error::other("injected create failure")
        )));

        mount
            .driver()
            .create_new(parent, attrs)
            .await
            .map_err(VnodeError::driver)
    }

    /// Hand the payload of a never-published vnode back to the driver.
    async fn abandon_load(&self, mount: &Mount<D>, vnode: &Arc<Vnode<D>>) {
        let payload = vnode.data.write().await.take();
        vnode.interlock.lock().key = None;
        if let Some(payload) = payload {
            if let Err(e) = mount.driver().reclaim(vnode, payload).await {
                panic!("driver failed to reclaim vnode {}: {}", vnode.serial(), e);
            }
        }
    }

    /// Fill in identity and payload of a vnode nobody else can see yet.
    async fn install(&self, vnode: &Arc<Vnode<D>>, node: LoadedNode<D::Payload>, key: CacheKey) {
        *vnode.data.write().await = Some(node.payload);
        let mut st = vnode.interlock.lock();
        st.vtype = node.vtype;
        st.rdev = node.rdev;
        st.key = Some(key);
    }

    /// Create a new object through the driver and cache its vnode.
    pub async fn create(
        self: &Arc<Self>,
        mount: &Arc<Mount<D>>,
        parent: &VnodeRef<D>,
        attrs: &D::Attributes,
    ) -> Result<VnodeRef<D>, VnodeError> {
        let Some(_busy) = mount.try_busy() else {
            return Err(VnodeError::Busy);
        };
        let pending = PendingVnode {
            cache: self,
            vnode: Some(self.alloc.alloc(mount)),
            slot: None,
        };
        VnodeStats::bump(&self.stats.allocated);
        pending.vnode().interlock.lock().flags.insert(VnodeFlags::CHANGING);

        VnodeStats::bump(&self.stats.creates);
        let node = match self.create_node(mount, parent, attrs).await {
            Ok(node) => node,
            Err(err) => {
                VnodeStats::bump(&self.stats.create_failures);
                debug!("create failed: {}", err);
                return Err(err);
            }
        };

        let ckey = CacheKey::new(mount.id(), node.key.clone());
        let vnode = Arc::clone(pending.vnode());
        self.install(&vnode, node, ckey.clone()).await;

        // an earlier vnode for a reused key may still be on its way out
        loop {
            let blocker = match self.directory.entry(ckey.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Slot::Live(Arc::clone(&vnode)));
                    break;
                }
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Live(old) => Lookup::Live(Arc::clone(old)),
                    Slot::Loading(done) | Slot::Moving { done, .. } => Lookup::Pending(done.subscribe()),
                },
            };
            match blocker {
                Lookup::Live(old) => match self.vget(&old, true).await {
                    Err(VnodeError::NotFound) => continue,
                    Ok(_) => panic!("driver created key {ckey:?} that is already live"),
                    Err(e) => panic!("unexpected error waiting out vnode for {ckey:?}: {e}"),
                },
                Lookup::Pending(mut done) => {
                    let _ = done.changed().await;
                }
                Lookup::Absent => {}
            }
        }
        pending.publish();
        vnode.end_change();
        debug!(serial = vnode.serial(), key = ?ckey, "vnode created");
        Ok(VnodeRef::from_counted(self, vnode))
    }

    /// Start moving the vnode cached under `old_key` to `new_key`. Until
    /// [`rekey_end`](Self::rekey_end), lookups of either key wait.
    pub fn rekey_begin(&self, mount: &Mount<D>, old_key: &[u8], new_key: &[u8]) -> Result<(), VnodeError> {
        let old = CacheKey::new(mount.id(), Bytes::copy_from_slice(old_key));
        let new = CacheKey::new(mount.id(), Bytes::copy_from_slice(new_key));

        match self.directory.entry(new.clone()) {
            Entry::Occupied(_) => return Err(VnodeError::AlreadyExists),
            Entry::Vacant(entry) => {
                entry.insert(Slot::pending());
            }
        }

        let moved = match self.directory.get_mut(&old) {
            Some(mut slot) => {
                let live = match &*slot {
                    Slot::Live(vnode) => Some(Arc::clone(vnode)),
                    _ => None,
                };
                match live {
                    Some(vnode) => {
                        *slot = Slot::Moving {
                            vnode,
                            done: watch::channel(()).0,
                        };
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };
        if !moved {
            self.directory.remove(&new);
            return Err(VnodeError::NotFound);
        }
        debug!(old = ?old, new = ?new, "rekey started");
        Ok(())
    }

    /// Finish a rekey: index the vnode under `new_key` and drop `old_key`.
    pub fn rekey_end(&self, mount: &Mount<D>, old_key: &[u8], new_key: &[u8]) {
        let old = CacheKey::new(mount.id(), Bytes::copy_from_slice(old_key));
        let new = CacheKey::new(mount.id(), Bytes::copy_from_slice(new_key));

        let vnode = match self.directory.get(&old) {
            Some(slot) => match slot.value() {
                Slot::Moving { vnode, .. } => Some(Arc::clone(vnode)),
                _ => None,
            },
            None => None,
        };

        let attached = match vnode {
            Some(vnode) => {
                // a reclaim that already took the old key will not see the new one
                let mut st = vnode.interlock.lock();
                if st.flags.contains(VnodeFlags::CLEAN) || st.key.as_ref() != Some(&old) {
                    false
                } else {
                    st.key = Some(new.clone());
                    self.directory.insert(new.clone(), Slot::Live(Arc::clone(&vnode)));
                    true
                }
            }
            None => false,
        };
        if !attached {
            // reclaimed while the rekey was in flight
            self.directory
                .remove_if(&new, |_, slot| matches!(slot, Slot::Loading(_)));
        }
        self.directory.remove_if(&old, |_, slot| matches!(slot, Slot::Moving { .. }));
        debug!(old = ?old, new = ?new, attached, "rekey finished");
    }

    /// Drop the directory row for `key`, whatever it holds.
    pub fn remove(&self, mount: &Mount<D>, key: &[u8]) {
        let ckey = CacheKey::new(mount.id(), Bytes::copy_from_slice(key));
        if let Some((_, slot)) = self.directory.remove(&ckey) {
            if let Slot::Live(vnode) | Slot::Moving { vnode, .. } = &slot {
                let mut st = vnode.interlock.lock();
                if st.key.as_ref() == Some(&ckey) {
                    st.key = None;
                }
            }
            debug!(key = ?ckey, "cache entry removed");
        }
    }

    /// Unlink a reclaimed vnode's row, if it still points at it.
    pub(crate) fn unlink(&self, vnode: &Arc<Vnode<D>>, key: &CacheKey) {
        self.directory.remove_if(key, |_, slot| slot.holds(vnode));
    }

    /// Free a vnode that never became visible.
    pub(crate) fn discard(&self, vnode: Arc<Vnode<D>>) {
        vnode.set_use_count(0);
        vnode.interlock.lock().flags.insert(VnodeFlags::CLEAN);
        self.alloc.free(vnode);
        VnodeStats::bump(&self.stats.destroyed);
    }

    /// Count a cached-page or buffer holder.
    pub fn hold(&self, vnode: &Vnode<D>) {
        let mut st = vnode.interlock.lock();
        self.freelists.hold(vnode, &mut st);
    }

    pub fn hold_release(&self, vnode: &Vnode<D>) {
        let mut st = vnode.interlock.lock();
        self.freelists.hold_release(vnode, &mut st);
    }

    /// An iteration placeholder owned by `mount`; never cached or counted.
    pub fn alloc_marker(&self, mount: &Arc<Mount<D>>) -> Arc<Vnode<D>> {
        self.alloc.alloc_marker(mount)
    }

    pub fn free_marker(&self, marker: Arc<Vnode<D>>) {
        assert!(marker.is_marker(), "vnode {} is not a marker", marker.serial());
        self.alloc.free(marker);
    }

    /// Every vnode the directory currently resolves, including ones being
    /// rekeyed.
    pub fn vnodes(&self) -> Vec<Arc<Vnode<D>>> {
        self.directory
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(vnode) | Slot::Moving { vnode, .. } => Some(Arc::clone(vnode)),
                Slot::Loading(_) => None,
            })
            .collect()
    }

    /// Vnodes parked on one free list, oldest first.
    pub fn free_vnodes(&self, kind: FreeListKind) -> Vec<Arc<Vnode<D>>> {
        self.freelists.snapshot(kind)
    }

    /// Live vnodes currently indexed for `mount`.
    pub(crate) fn mount_vnodes(&self, mount: &Mount<D>) -> Vec<Arc<Vnode<D>>> {
        self.directory
            .iter()
            .filter(|entry| entry.key().mount == mount.id())
            .filter_map(|entry| match entry.value() {
                Slot::Live(vnode) => Some(Arc::clone(vnode)),
                _ => None,
            })
            .collect()
    }

    /// Live vnodes aliasing one device.
    pub(crate) fn device_vnodes(&self, dev: DevId, vtype: VType) -> Vec<Arc<Vnode<D>>> {
        let live: Vec<_> = self
            .directory
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(vnode) => Some(Arc::clone(vnode)),
                _ => None,
            })
            .collect();
        live.into_iter()
            .filter(|vnode| {
                let st = vnode.interlock.lock();
                st.vtype == vtype && st.rdev == Some(dev)
            })
            .collect()
    }

    /// A referenced vnode for device `dev` of type `vtype`, if one is cached.
    pub async fn find_device(self: &Arc<Self>, dev: DevId, vtype: VType) -> Option<VnodeRef<D>> {
        for vnode in self.device_vnodes(dev, vtype) {
            if let Ok(handle) = self.vget(&vnode, true).await {
                return Some(handle);
            }
        }
        None
    }
}
