use super::{Owner, Vnode, VnodeFlags};
use crate::driver::{FsDriver, Mount};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Hands out vnode storage and keeps the live count the drain worker
/// steers by.
pub(crate) struct Allocator {
    numvnodes: AtomicUsize,
    desired: AtomicUsize,
    next_serial: AtomicU64,
    drain_signal: Notify,
}

impl Allocator {
    pub fn new(desired: usize) -> Self {
        Self {
            numvnodes: AtomicUsize::new(0),
            desired: AtomicUsize::new(desired),
            next_serial: AtomicU64::new(1),
            drain_signal: Notify::new(),
        }
    }

    pub fn numvnodes(&self) -> usize {
        self.numvnodes.load(Ordering::SeqCst)
    }

    pub fn desired(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    pub fn set_desired(&self, desired: usize) -> usize {
        self.desired.swap(desired, Ordering::SeqCst)
    }

    pub fn over_target(&self) -> bool {
        self.numvnodes() > self.desired()
    }

    pub fn drain_signal(&self) -> &Notify {
        &self.drain_signal
    }

    /// Wake the drain worker without waiting for it.
    pub fn signal_drain(&self) {
        self.drain_signal.notify_one();
    }

    /// A fresh vnode holding one reference, on no list, with no identity.
    pub fn alloc<D: FsDriver>(&self, mount: &Arc<Mount<D>>) -> Arc<Vnode<D>> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let vnode = Arc::new(Vnode::new(
            serial,
            Owner::Mount(Arc::clone(mount)),
            VnodeFlags::empty(),
            1,
        ));
        let live = self.numvnodes.fetch_add(1, Ordering::SeqCst) + 1;
        if live > self.desired() {
            self.signal_drain();
        }
        vnode
    }

    /// A placeholder for iteration cursors. Not counted.
    pub fn alloc_marker<D: FsDriver>(&self, mount: &Arc<Mount<D>>) -> Arc<Vnode<D>> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        Arc::new(Vnode::new(
            serial,
            Owner::Mount(Arc::clone(mount)),
            VnodeFlags::MARKER,
            0,
        ))
    }

    /// Return a vnode whose last reference is gone. Storage goes away with
    /// the last `Arc`.
    pub fn free<D: FsDriver>(&self, vnode: Arc<Vnode<D>>) {
        assert_eq!(
            vnode.use_count(),
            0,
            "freeing referenced vnode {}",
            vnode.serial()
        );
        let marker = {
            let mut st = vnode.interlock.lock();
            debug_assert!(st.list.is_none(), "freeing vnode {} still on a free list", vnode.serial());
            st.owner = Owner::Dead;
            st.flags.contains(VnodeFlags::MARKER)
        };
        if !marker {
            self.numvnodes.fetch_sub(1, Ordering::SeqCst);
        }
        vnode.wakeup();
    }
}
