use super::{Vnode, VnodeFlags, VnodeState};
use crate::driver::{FsDriver, MountBusy};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeListKind {
    /// No cached pages or buffers; reclaimed first.
    NoHold,
    /// Still holding cached pages or buffers.
    Hold,
}

impl FreeListKind {
    fn for_hold(hold: u32) -> Self {
        if hold == 0 {
            FreeListKind::NoHold
        } else {
            FreeListKind::Hold
        }
    }
}

/// Position of a vnode on a free list, recorded in its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeSlot {
    pub kind: FreeListKind,
    seq: u64,
}

struct Lists<D: FsDriver> {
    no_hold: BTreeMap<u64, Arc<Vnode<D>>>,
    hold: BTreeMap<u64, Arc<Vnode<D>>>,
    next_seq: u64,
}

impl<D: FsDriver> Lists<D> {
    fn list(&mut self, kind: FreeListKind) -> &mut BTreeMap<u64, Arc<Vnode<D>>> {
        match kind {
            FreeListKind::NoHold => &mut self.no_hold,
            FreeListKind::Hold => &mut self.hold,
        }
    }

    fn push(&mut self, kind: FreeListKind, vnode: Arc<Vnode<D>>) -> FreeSlot {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.list(kind).insert(seq, vnode);
        FreeSlot { kind, seq }
    }
}

/// The two lists of unreferenced vnodes, in insertion order.
///
/// Every method that takes a `VnodeState` expects the caller to hold that
/// vnode's interlock; the list lock is taken inside. Victim selection runs
/// the other way round and therefore only try-locks interlocks.
pub(crate) struct FreeLists<D: FsDriver> {
    inner: Mutex<Lists<D>>,
}

impl<D: FsDriver> FreeLists<D> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Lists {
                no_hold: BTreeMap::new(),
                hold: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn len(&self, kind: FreeListKind) -> usize {
        let mut lists = self.inner.lock();
        lists.list(kind).len()
    }

    pub fn snapshot(&self, kind: FreeListKind) -> Vec<Arc<Vnode<D>>> {
        let mut lists = self.inner.lock();
        lists.list(kind).values().cloned().collect()
    }

    /// Park an unreferenced vnode on the list matching its hold count.
    pub fn insert(&self, vnode: &Arc<Vnode<D>>, st: &mut VnodeState<D>) {
        debug_assert_eq!(vnode.use_count(), 0, "parking referenced vnode {}", vnode.serial());
        debug_assert!(st.list.is_none(), "vnode {} already on a free list", vnode.serial());
        let kind = FreeListKind::for_hold(st.hold);
        st.list = Some(self.inner.lock().push(kind, Arc::clone(vnode)));
    }

    pub fn remove(&self, vnode: &Vnode<D>, st: &mut VnodeState<D>) {
        let Some(slot) = st.list.take() else {
            panic!("vnode {} is not on a free list", vnode.serial());
        };
        let removed = self.inner.lock().list(slot.kind).remove(&slot.seq);
        debug_assert!(removed.is_some(), "free list lost vnode {}", vnode.serial());
    }

    pub fn hold(&self, vnode: &Vnode<D>, st: &mut VnodeState<D>) {
        st.hold += 1;
        if st.hold == 1 {
            self.requeue(st);
        }
        tracing::trace!(serial = vnode.serial(), hold = st.hold, "vnode held");
    }

    pub fn hold_release(&self, vnode: &Vnode<D>, st: &mut VnodeState<D>) {
        assert!(st.hold > 0, "hold count underflow on vnode {}", vnode.serial());
        st.hold -= 1;
        if st.hold == 0 {
            self.requeue(st);
        }
        tracing::trace!(serial = vnode.serial(), hold = st.hold, "vnode hold released");
    }

    /// Move a parked vnode to the list its hold count now calls for.
    fn requeue(&self, st: &mut VnodeState<D>) {
        let Some(slot) = st.list else {
            return;
        };
        let kind = FreeListKind::for_hold(st.hold);
        if slot.kind == kind {
            return;
        }
        let mut lists = self.inner.lock();
        if let Some(vnode) = lists.list(slot.kind).remove(&slot.seq) {
            st.list = Some(lists.push(kind, vnode));
        }
    }

    /// Take the oldest reclaimable vnode, preferring the no-hold list.
    ///
    /// Skips vnodes whose interlock is contended, that are mid-transition,
    /// or whose mount refuses work. The returned vnode has been unlinked and
    /// carries one reference owned by the caller, along with a busy guard on
    /// its mount.
    pub fn take_victim(&self) -> Option<(Arc<Vnode<D>>, MountBusy<D>)> {
        let mut lists = self.inner.lock();
        for kind in [FreeListKind::NoHold, FreeListKind::Hold] {
            let found = lists.list(kind).iter().find_map(|(seq, vnode)| {
                let mut st = vnode.interlock.try_lock()?;
                if st
                    .flags
                    .intersects(VnodeFlags::XLOCK | VnodeFlags::CHANGING | VnodeFlags::CLEAN)
                {
                    return None;
                }
                let busy = st.owner.mount()?.try_busy()?;
                st.list = None;
                vnode.set_use_count(1);
                Some((*seq, Arc::clone(vnode), busy))
            });
            if let Some((seq, vnode, busy)) = found {
                lists.list(kind).remove(&seq);
                return Some((vnode, busy));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Mount;
    use crate::memfs::MemFs;
    use crate::vnode::Allocator;

    fn parked(alloc: &Allocator, lists: &FreeLists<MemFs>, mount: &Arc<Mount<MemFs>>) -> Arc<Vnode<MemFs>> {
        let vnode = alloc.alloc(mount);
        vnode.set_use_count(0);
        let mut st = vnode.interlock.lock();
        lists.insert(&vnode, &mut st);
        drop(st);
        vnode
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let mount = Mount::new(MemFs::new());
        let alloc = Allocator::new(100);
        let lists = FreeLists::new();

        let vnode = parked(&alloc, &lists, &mount);
        assert_eq!(vnode.free_list(), Some(FreeListKind::NoHold));
        assert_eq!(lists.len(FreeListKind::NoHold), 1);

        let mut st = vnode.interlock.lock();
        lists.remove(&vnode, &mut st);
        drop(st);
        assert_eq!(vnode.free_list(), None);
        assert_eq!(lists.len(FreeListKind::NoHold), 0);
    }

    #[tokio::test]
    async fn test_hold_moves_between_lists() {
        let mount = Mount::new(MemFs::new());
        let alloc = Allocator::new(100);
        let lists = FreeLists::new();
        let vnode = parked(&alloc, &lists, &mount);

        {
            let mut st = vnode.interlock.lock();
            lists.hold(&vnode, &mut st);
            lists.hold(&vnode, &mut st);
        }
        assert_eq!(vnode.free_list(), Some(FreeListKind::Hold));
        assert_eq!(vnode.hold_count(), 2);
        assert_eq!(lists.len(FreeListKind::NoHold), 0);
        assert_eq!(lists.len(FreeListKind::Hold), 1);

        {
            let mut st = vnode.interlock.lock();
            lists.hold_release(&vnode, &mut st);
        }
        assert_eq!(vnode.free_list(), Some(FreeListKind::Hold));

        {
            let mut st = vnode.interlock.lock();
            lists.hold_release(&vnode, &mut st);
        }
        assert_eq!(vnode.free_list(), Some(FreeListKind::NoHold));
        assert_eq!(lists.len(FreeListKind::Hold), 0);
    }

    #[tokio::test]
    async fn test_victim_prefers_no_hold_in_insertion_order() {
        let mount = Mount::new(MemFs::new());
        let alloc = Allocator::new(100);
        let lists = FreeLists::new();

        let held = parked(&alloc, &lists, &mount);
        {
            let mut st = held.interlock.lock();
            lists.hold(&held, &mut st);
        }
        let first = parked(&alloc, &lists, &mount);
        let second = parked(&alloc, &lists, &mount);

        let (victim, _busy) = lists.take_victim().unwrap();
        assert!(Arc::ptr_eq(&victim, &first));
        assert_eq!(victim.use_count(), 1);
        assert_eq!(victim.free_list(), None);
        assert_eq!(mount.busy_count(), 1);

        let (victim, _busy) = lists.take_victim().unwrap();
        assert!(Arc::ptr_eq(&victim, &second));

        let (victim, _busy) = lists.take_victim().unwrap();
        assert!(Arc::ptr_eq(&victim, &held));

        assert!(lists.take_victim().is_none());
    }

    #[tokio::test]
    async fn test_victim_skips_locked_and_suspended() {
        let mount = Mount::new(MemFs::new());
        let alloc = Allocator::new(100);
        let lists = FreeLists::new();

        let locked = parked(&alloc, &lists, &mount);
        let guard = locked.interlock.lock();
        assert!(lists.take_victim().is_none());
        drop(guard);

        mount.suspend();
        assert!(lists.take_victim().is_none());
        mount.resume();

        let (victim, busy) = lists.take_victim().unwrap();
        assert!(Arc::ptr_eq(&victim, &locked));
        drop(busy);
        assert_eq!(mount.busy_count(), 0);
    }
}
