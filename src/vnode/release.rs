use super::release_worker::ReleaseRequest;
use super::{Vnode, VnodeCache, VnodeFlags, VnodeRef};
use crate::driver::FsDriver;
use crate::errors::VnodeError;
use crate::stats::VnodeStats;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(feature = "failpoints")]
use crate::failpoints as fp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Run deactivation inline when the last reference goes.
    Sync,
    /// Hand deactivation to the deferred release worker.
    AsyncPreferred,
}

/// Who is dropping the reference, which decides whether the release path
/// may wait for the vnode lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOrigin {
    /// An ordinary caller. Never waits for the vnode lock; defers instead.
    Caller,
    /// A caller that declared it must not block at all.
    NoBlock,
    /// A background worker, always free to wait.
    Worker,
}

impl<D: FsDriver> VnodeCache<D> {
    /// Take a reference on a vnode found in the directory or on a free list.
    ///
    /// A parked vnode is unlinked from its free list. With `wait`, an
    /// in-progress transition is waited out; without it the call fails with
    /// `Busy`. Reports `NotFound` if the vnode is, or turns out to be, clean.
    ///
    /// A reclaim in progress is waited out without taking a reference, so
    /// the reclaimer's release stays the last one.
    pub(crate) async fn vget(self: &Arc<Self>, vnode: &Arc<Vnode<D>>, wait: bool) -> Result<VnodeRef<D>, VnodeError> {
        loop {
            {
                let mut st = vnode.interlock.lock();
                if st.flags.contains(VnodeFlags::CLEAN) {
                    return Err(VnodeError::NotFound);
                }
                if !wait && st.busy() {
                    return Err(VnodeError::Busy);
                }
                if !st.flags.contains(VnodeFlags::XLOCK) {
                    if vnode.use_count() == 0 {
                        self.freelists.remove(vnode, &mut st);
                        vnode.set_use_count(1);
                        VnodeStats::bump(&self.stats.reused);
                    } else {
                        vnode.add_ref();
                    }
                    break;
                }
            }
            vnode.dead_check(true).await?;
        }
        let handle = VnodeRef::from_counted(self, Arc::clone(vnode));

        if wait {
            vnode.wait_stable().await;
            if vnode.is_clean() {
                handle.release().await;
                return Err(VnodeError::NotFound);
            }
        }
        Ok(handle)
    }

    /// Drop a reference in the given mode.
    pub async fn drop_ref(&self, handle: VnodeRef<D>, mode: ReleaseMode) {
        let (_, vnode) = handle.into_parts();
        self.vrele(vnode, mode, ReleaseOrigin::Caller).await;
    }

    pub(crate) async fn vrele(&self, vnode: Arc<Vnode<D>>, mode: ReleaseMode, origin: ReleaseOrigin) {
        if let Some(vnode) = self.vrele_prologue(vnode, mode, origin) {
            self.release_inactive(vnode, origin).await;
        }
    }

    /// The part of a release that never waits.
    ///
    /// Returns the vnode, still carrying the last reference, when the caller
    /// should go on to deactivate it inline. Every other outcome (plain
    /// decrement, destruction of a clean vnode, hand-off to the worker) is
    /// finished here.
    pub(crate) fn vrele_prologue(
        &self,
        vnode: Arc<Vnode<D>>,
        mode: ReleaseMode,
        origin: ReleaseOrigin,
    ) -> Option<Arc<Vnode<D>>> {
        if vnode.try_release_fast() {
            return None;
        }

        let st = vnode.interlock.lock();
        // a reference may have appeared since the fast path gave up
        if vnode.try_release_fast() {
            return None;
        }
        assert!(vnode.use_count() == 1, "releasing unreferenced vnode {}", vnode.serial());

        if st.flags.contains(VnodeFlags::CLEAN) {
            vnode.set_use_count(0);
            drop(st);
            self.destroy(vnode);
            return None;
        }
        drop(st);

        if origin == ReleaseOrigin::NoBlock || mode == ReleaseMode::AsyncPreferred {
            self.defer_release(vnode);
            return None;
        }
        Some(vnode)
    }

    /// Last-reference handling proper: deactivate, then reclaim or park.
    pub(crate) async fn release_inactive(&self, vnode: Arc<Vnode<D>>, origin: ReleaseOrigin) {
        let node = Arc::clone(&vnode);
        let mut data = if origin == ReleaseOrigin::Worker {
            node.data.write().await
        } else {
            match node.data.try_write() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(serial = vnode.serial(), "vnode locked, deferring release");
                    self.defer_release(vnode);
                    return;
                }
            }
        };

        #[cfg(feature = "failpoints")]
        fp::fail_point!(fp::RELEASE_BEFORE_DEACTIVATE);

        if !vnode.begin_change().await {
            // reclaimed while we waited for the lock
            drop(data);
            let rest = self.vrele_prologue(vnode, ReleaseMode::Sync, origin);
            debug_assert!(rest.is_none(), "clean vnode survived release");
            return;
        }

        let mount = vnode.interlock.lock().owner.mount().cloned();
        let Some(mount) = mount else {
            panic!("live vnode {} has no mount", vnode.serial());
        };
        let Some(payload) = data.as_mut() else {
            panic!("live vnode {} has no payload", vnode.serial());
        };
        let recycle = mount.driver().deactivate(&vnode, payload).await;

        if vnode.try_release_fast() {
            debug!(serial = vnode.serial(), "vnode referenced during deactivate");
            vnode.end_change();
            return;
        }

        if recycle {
            self.reclaim_locked(&vnode, &mut data).await;
        }

        let mut st = vnode.interlock.lock();
        st.flags.remove(VnodeFlags::CHANGING);
        if vnode.try_release_fast() {
            drop(st);
            vnode.wakeup();
            return;
        }
        vnode.set_use_count(0);
        if st.flags.contains(VnodeFlags::CLEAN) {
            drop(st);
            drop(data);
            vnode.wakeup();
            self.destroy(vnode);
            return;
        }
        self.freelists.insert(&vnode, &mut st);
        VnodeStats::bump(&self.stats.parked);
        drop(st);
        drop(data);
        vnode.wakeup();
        debug!(serial = vnode.serial(), "vnode parked");
    }

    fn defer_release(&self, vnode: Arc<Vnode<D>>) {
        VnodeStats::bump(&self.stats.deferred_releases);
        if let Err(err) = self.release_tx.send(ReleaseRequest::Release(vnode)) {
            let ReleaseRequest::Release(vnode) = err.0 else {
                unreachable!("sent a release request");
            };
            warn!(serial = vnode.serial(), "release worker gone, parking without deactivation");
            self.park_undeactivated(vnode);
        }
    }

    /// Fallback once the release worker has stopped.
    fn park_undeactivated(&self, vnode: Arc<Vnode<D>>) {
        let mut st = vnode.interlock.lock();
        if vnode.try_release_fast() {
            return;
        }
        vnode.set_use_count(0);
        if st.flags.contains(VnodeFlags::CLEAN) {
            drop(st);
            self.destroy(vnode);
            return;
        }
        self.freelists.insert(&vnode, &mut st);
        VnodeStats::bump(&self.stats.parked);
    }

    /// Free a vnode whose count reached zero, unlinking it first.
    fn destroy(&self, vnode: Arc<Vnode<D>>) {
        let key = vnode.interlock.lock().key.take();
        if let Some(key) = key {
            self.unlink(&vnode, &key);
        }
        debug!(serial = vnode.serial(), "vnode destroyed");
        self.alloc.free(vnode);
        VnodeStats::bump(&self.stats.destroyed);
    }

    /// Reclaim a referenced vnode now, then drop the reference (`vgone`).
    pub async fn gone(&self, handle: VnodeRef<D>) {
        let (_, vnode) = handle.into_parts();
        {
            let mut data = vnode.data.write().await;
            if vnode.begin_change().await {
                self.reclaim_locked(&vnode, &mut data).await;
                vnode.end_change();
            }
        }
        self.vrele(vnode, ReleaseMode::Sync, ReleaseOrigin::Worker).await;
    }

    /// Reclaim the vnode if the caller holds the only reference, then drop
    /// that reference. Returns whether it was reclaimed.
    pub async fn recycle(&self, handle: VnodeRef<D>) -> bool {
        let (_, vnode) = handle.into_parts();
        let recycled = {
            let mut data = vnode.data.write().await;
            if vnode.begin_change().await {
                let sole = vnode.xlock_if_sole();
                if sole {
                    self.reclaim_locked(&vnode, &mut data).await;
                }
                vnode.end_change();
                sole
            } else {
                false
            }
        };
        self.vrele(vnode, ReleaseMode::Sync, ReleaseOrigin::Worker).await;
        recycled
    }

    /// Reclaim the vnode and, for a device, every alias of the same device.
    pub async fn revoke(self: &Arc<Self>, handle: &VnodeRef<D>) {
        let (vtype, rdev) = {
            let st = handle.interlock.lock();
            (st.vtype, st.rdev)
        };
        match rdev {
            Some(dev) if vtype.is_device() => {
                for alias in self.device_vnodes(dev, vtype) {
                    if let Ok(alias) = self.vget(&alias, true).await {
                        self.gone(alias).await;
                    }
                }
            }
            _ => self.gone(handle.clone()).await,
        }
    }
}
