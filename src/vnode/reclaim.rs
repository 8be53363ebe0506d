use super::{DevId, Owner, VType, Vnode, VnodeCache, VnodeFlags};
use crate::driver::{FsDriver, InvalidateMode, Mount};
use crate::errors::VnodeError;
use crate::stats::VnodeStats;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[cfg(feature = "failpoints")]
use crate::failpoints as fp;

impl<D: FsDriver> VnodeCache<D> {
    /// Disassociate a vnode from its file system and mark it clean.
    ///
    /// The caller holds `data` exclusively, has marked the vnode `CHANGING`
    /// and holds a reference. On return the payload is gone, the vnode is
    /// unlinked from the directory and owned by the dead instance.
    pub(crate) async fn reclaim_locked(&self, vnode: &Arc<Vnode<D>>, data: &mut Option<D::Payload>) {
        let (mount, active) = {
            let mut st = vnode.interlock.lock();
            assert!(
                !st.flags.contains(VnodeFlags::CLEAN),
                "reclaiming clean vnode {}",
                vnode.serial()
            );
            st.flags.insert(VnodeFlags::XLOCK);
            let Some(mount) = st.owner.mount().cloned() else {
                panic!("reclaiming vnode {} without a mount", vnode.serial());
            };
            (mount, vnode.use_count() > 1)
        };

        #[cfg(feature = "failpoints")]
        fp::fail_point!(fp::RECLAIM_AFTER_XLOCK);

        let Some(mut payload) = data.take() else {
            panic!("reclaiming vnode {} without a payload", vnode.serial());
        };
        let driver = mount.driver();

        if let Err(e) = driver
            .invalidate_cached_data(vnode, &mut payload, InvalidateMode::Flush)
            .await
        {
            warn!(serial = vnode.serial(), "flush before reclaim failed, discarding: {}", e);
            if let Err(e) = driver
                .invalidate_cached_data(vnode, &mut payload, InvalidateMode::Discard)
                .await
            {
                error!(serial = vnode.serial(), "discarding cached data failed: {}", e);
            }
        }

        #[cfg(feature = "failpoints")]
        fp::fail_point!(fp::RECLAIM_AFTER_INVALIDATE);

        if active {
            driver.deactivate(vnode, &mut payload).await;
        }

        if let Err(e) = driver.reclaim(vnode, payload).await {
            panic!("driver failed to reclaim vnode {}: {}", vnode.serial(), e);
        }
        driver.purge_names(vnode);

        let key = vnode.interlock.lock().key.take();
        if let Some(key) = &key {
            self.unlink(vnode, key);
        }

        {
            let mut st = vnode.interlock.lock();
            st.owner = Owner::Dead;
            st.flags.insert(VnodeFlags::CLEAN);
            st.flags.remove(VnodeFlags::XLOCK);
        }
        vnode.wakeup();
        VnodeStats::bump(&self.stats.reclaims);
        debug!(serial = vnode.serial(), key = ?key, active, "vnode reclaimed");
    }

    /// Reclaim every cached vnode of `mount`.
    ///
    /// Without `force`, vnodes that someone else still references are left
    /// alone and the call reports `Busy` once the rest are gone.
    pub async fn flush_mount(self: &Arc<Self>, mount: &Mount<D>, force: bool) -> Result<(), VnodeError> {
        let mut busy = 0usize;
        let mut flushed = 0usize;
        for vnode in self.mount_vnodes(mount) {
            let Ok(handle) = self.vget(&vnode, true).await else {
                continue;
            };
            if handle.use_count() > 1 && !force {
                busy += 1;
                handle.release().await;
                continue;
            }
            self.gone(handle).await;
            flushed += 1;
        }

        if busy > 0 {
            warn!(mount = %mount.id(), busy, flushed, "mount flush left busy vnodes");
            return Err(VnodeError::Busy);
        }
        info!(mount = %mount.id(), flushed, "mount flushed");
        Ok(())
    }

    /// Revoke every vnode of a device range, as when its driver detaches.
    pub async fn dev_gone(self: &Arc<Self>, major: u32, minors: RangeInclusive<u32>, vtype: VType) {
        for minor in minors {
            let dev = DevId::new(major, minor);
            while let Some(handle) = self.find_device(dev, vtype).await {
                self.gone(handle).await;
            }
        }
    }
}
