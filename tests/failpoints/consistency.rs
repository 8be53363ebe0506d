use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vcache::vnode::{FreeListKind, Vnode, VnodeFlags};
use vcache::{FsDriver, VnodeCache};

#[derive(Debug, Default)]
pub struct ConsistencyReport {
    pub errors: Vec<ConsistencyError>,
    pub stats: VerificationStats,
}

#[derive(Debug, Default)]
pub struct VerificationStats {
    pub indexed_checked: u64,
    pub parked_checked: u64,
}

#[derive(Debug)]
pub enum ConsistencyError {
    /// A vnode reachable from the directory is clean or owned by the dead instance.
    CleanInDirectory { serial: u64 },
    /// A transition flag is still set on a quiescent cache.
    TransitionLeftOpen { serial: u64, flags: VnodeFlags },
    /// Use count and free-list membership disagree.
    FreeListMismatch {
        serial: u64,
        use_count: u32,
        hold_count: u32,
        list: Option<FreeListKind>,
    },
    /// A vnode sits on a list other than the one its state records.
    WrongList {
        serial: u64,
        found_on: FreeListKind,
        recorded: Option<FreeListKind>,
    },
    /// Two directory rows resolve to vnodes claiming the same key.
    DuplicateKey { serial_a: u64, serial_b: u64 },
    /// A directory vnode has no key of its own.
    MissingKey { serial: u64 },
    /// More distinct vnodes are reachable than the allocator counts.
    LiveCountTooLow { counted: usize, reachable: usize },
}

fn expected_list(hold: u32) -> FreeListKind {
    if hold == 0 {
        FreeListKind::NoHold
    } else {
        FreeListKind::Hold
    }
}

fn check_counts<D: FsDriver>(vnode: &Vnode<D>, errors: &mut Vec<ConsistencyError>) {
    let use_count = vnode.use_count();
    let hold_count = vnode.hold_count();
    let list = vnode.free_list();
    let ok = match list {
        Some(kind) => use_count == 0 && kind == expected_list(hold_count),
        None => use_count > 0,
    };
    if !ok {
        errors.push(ConsistencyError::FreeListMismatch {
            serial: vnode.serial(),
            use_count,
            hold_count,
            list,
        });
    }
}

/// Check the cache's structural invariants. Only meaningful once every
/// operation has finished and deferred releases have been flushed.
pub async fn verify_consistency<D: FsDriver>(cache: &Arc<VnodeCache<D>>) -> anyhow::Result<ConsistencyReport> {
    cache.flush_releases().await?;

    let mut report = ConsistencyReport::default();
    let mut reachable: HashSet<u64> = HashSet::new();
    let mut keys: HashMap<(String, Vec<u8>), u64> = HashMap::new();

    for vnode in cache.vnodes() {
        report.stats.indexed_checked += 1;
        reachable.insert(vnode.serial());

        if vnode.is_clean() || vnode.owner().is_dead() {
            report.errors.push(ConsistencyError::CleanInDirectory {
                serial: vnode.serial(),
            });
        }
        let flags = vnode.flags();
        if flags.intersects(VnodeFlags::CHANGING | VnodeFlags::XLOCK) {
            report.errors.push(ConsistencyError::TransitionLeftOpen {
                serial: vnode.serial(),
                flags,
            });
        }
        check_counts(&vnode, &mut report.errors);

        let mount = vnode
            .owner()
            .mount()
            .map(|m| m.id().to_string())
            .unwrap_or_default();
        match vnode.key() {
            Some(key) => {
                if let Some(other) = keys.insert((mount, key.to_vec()), vnode.serial()) {
                    report.errors.push(ConsistencyError::DuplicateKey {
                        serial_a: other,
                        serial_b: vnode.serial(),
                    });
                }
            }
            None => report.errors.push(ConsistencyError::MissingKey {
                serial: vnode.serial(),
            }),
        }
    }

    for kind in [FreeListKind::NoHold, FreeListKind::Hold] {
        for vnode in cache.free_vnodes(kind) {
            report.stats.parked_checked += 1;
            reachable.insert(vnode.serial());
            if vnode.free_list() != Some(kind) {
                report.errors.push(ConsistencyError::WrongList {
                    serial: vnode.serial(),
                    found_on: kind,
                    recorded: vnode.free_list(),
                });
            }
            if vnode.is_clean() {
                report.errors.push(ConsistencyError::CleanInDirectory {
                    serial: vnode.serial(),
                });
            }
            check_counts(&vnode, &mut report.errors);
        }
    }

    if cache.numvnodes() < reachable.len() {
        report.errors.push(ConsistencyError::LiveCountTooLow {
            counted: cache.numvnodes(),
            reachable: reachable.len(),
        });
    }

    Ok(report)
}
