use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct VnodeStats {
    pub allocated: AtomicU64,
    pub destroyed: AtomicU64,
    pub loads: AtomicU64,
    pub load_failures: AtomicU64,
    pub creates: AtomicU64,
    pub create_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub reused: AtomicU64,
    pub parked: AtomicU64,
    pub deferred_releases: AtomicU64,
    pub reclaims: AtomicU64,
    pub drained: AtomicU64,
}

/// Point-in-time copy of [`VnodeStats`] plus the gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub numvnodes: u64,
    pub desired_vnodes: u64,
    pub free_no_hold: u64,
    pub free_hold: u64,
    pub cached: u64,
    pub allocated: u64,
    pub destroyed: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub creates: u64,
    pub create_failures: u64,
    pub cache_hits: u64,
    pub reused: u64,
    pub parked: u64,
    pub deferred_releases: u64,
    pub reclaims: u64,
    pub drained: u64,
}

impl VnodeStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            allocated: get(&self.allocated),
            destroyed: get(&self.destroyed),
            loads: get(&self.loads),
            load_failures: get(&self.load_failures),
            creates: get(&self.creates),
            create_failures: get(&self.create_failures),
            cache_hits: get(&self.cache_hits),
            reused: get(&self.reused),
            parked: get(&self.parked),
            deferred_releases: get(&self.deferred_releases),
            reclaims: get(&self.reclaims),
            drained: get(&self.drained),
            ..Default::default()
        }
    }
}
