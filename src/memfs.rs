//! An in-memory file system driver.
//!
//! Inodes live in a concurrent table keyed by inode number; the cache key of
//! an inode is its number in big-endian bytes. Used by the tests and by the
//! `stress` command.

use crate::driver::{FsDriver, InvalidateMode, LoadedNode};
use crate::vnode::{DevId, VType, Vnode, VnodeRef};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

pub const ROOT_INO: u64 = 1;

#[derive(Debug, Error)]
pub enum MemFsError {
    #[error("inode {0} not found")]
    NotFound(u64),
    #[error("malformed key of {0} bytes")]
    BadKey(usize),
    #[error("inode {0} is not a directory")]
    NotDirectory(u64),
    #[error("parent vnode is dead")]
    DeadParent,
    #[error("flush of inode {0} rejected")]
    FlushRejected(u64),
}

#[derive(Debug, Clone)]
struct Inode {
    vtype: VType,
    nlink: u32,
    rdev: Option<DevId>,
}

/// Per-vnode state the cache carries for `MemFs`.
#[derive(Debug)]
pub struct MemNode {
    pub ino: u64,
    pub vtype: VType,
    /// Set by writers; cleared by flush or discard.
    pub dirty: bool,
}

/// Attributes for `create_new`.
#[derive(Debug, Clone, Copy)]
pub struct MemAttrs {
    pub vtype: VType,
    pub rdev: Option<DevId>,
}

impl MemAttrs {
    pub fn file() -> Self {
        Self {
            vtype: VType::Reg,
            rdev: None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    creates: AtomicU64,
    deactivates: AtomicU64,
    reclaims: AtomicU64,
    flushes: AtomicU64,
    discards: AtomicU64,
}

#[derive(Debug)]
pub struct MemFs {
    inodes: DashMap<u64, Inode>,
    next_ino: AtomicU64,
    latency: Option<Duration>,
    fail_flush: AtomicBool,
    counters: Counters,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// A file system holding only the root directory.
    pub fn new() -> Self {
        let inodes = DashMap::new();
        inodes.insert(
            ROOT_INO,
            Inode {
                vtype: VType::Dir,
                nlink: 2,
                rdev: None,
            },
        );
        Self {
            inodes,
            next_ino: AtomicU64::new(ROOT_INO + 1),
            latency: None,
            fail_flush: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Like [`MemFs::new`], with every driver call delayed by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    pub fn key(ino: u64) -> [u8; 8] {
        ino.to_be_bytes()
    }

    fn ino_of(key: &[u8]) -> Result<u64, MemFsError> {
        let bytes: [u8; 8] = key.try_into().map_err(|_| MemFsError::BadKey(key.len()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn allocate(&self, vtype: VType, rdev: Option<DevId>) -> u64 {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.inodes.insert(
            ino,
            Inode {
                vtype,
                nlink: 1,
                rdev,
            },
        );
        ino
    }

    /// Make an inode directly, bypassing the cache.
    pub fn mknod(&self, vtype: VType, rdev: Option<DevId>) -> u64 {
        self.allocate(vtype, rdev)
    }

    /// Drop one link. The inode itself goes when its vnode is reclaimed.
    pub fn unlink(&self, ino: u64) {
        if let Some(mut inode) = self.inodes.get_mut(&ino) {
            inode.nlink = inode.nlink.saturating_sub(1);
        }
    }

    pub fn exists(&self, ino: u64) -> bool {
        self.inodes.contains_key(&ino)
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Make every subsequent flush fail, forcing the discard fallback.
    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    pub fn loads(&self) -> u64 {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> u64 {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn deactivates(&self) -> u64 {
        self.counters.deactivates.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> u64 {
        self.counters.reclaims.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> u64 {
        self.counters.flushes.load(Ordering::SeqCst)
    }

    pub fn discards(&self) -> u64 {
        self.counters.discards.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn unlinked(&self, ino: u64) -> bool {
        self.inodes.get(&ino).is_none_or(|inode| inode.nlink == 0)
    }
}

#[async_trait]
impl FsDriver for MemFs {
    type Payload = MemNode;
    type Attributes = MemAttrs;
    type Error = MemFsError;

    async fn load_by_key(&self, key: &[u8]) -> Result<LoadedNode<MemNode>, MemFsError> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        let ino = Self::ino_of(key)?;
        self.delay().await;

        let inode = self
            .inodes
            .get(&ino)
            .map(|inode| inode.clone())
            .ok_or(MemFsError::NotFound(ino))?;
        let node = MemNode {
            ino,
            vtype: inode.vtype,
            dirty: false,
        };
        let loaded = LoadedNode::new(inode.vtype, node, Self::key(ino).to_vec());
        Ok(match inode.rdev {
            Some(rdev) => loaded.with_rdev(rdev),
            None => loaded,
        })
    }

    async fn create_new(&self, parent: &VnodeRef<Self>, attrs: &MemAttrs) -> Result<LoadedNode<MemNode>, MemFsError> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        {
            let parent = parent.read().await.map_err(|_| MemFsError::DeadParent)?;
            if parent.vtype != VType::Dir {
                return Err(MemFsError::NotDirectory(parent.ino));
            }
        }
        self.delay().await;

        let ino = self.allocate(attrs.vtype, attrs.rdev);
        let node = MemNode {
            ino,
            vtype: attrs.vtype,
            dirty: false,
        };
        let loaded = LoadedNode::new(attrs.vtype, node, Self::key(ino).to_vec());
        Ok(match attrs.rdev {
            Some(rdev) => loaded.with_rdev(rdev),
            None => loaded,
        })
    }

    async fn deactivate(&self, _vnode: &Vnode<Self>, payload: &mut MemNode) -> bool {
        self.counters.deactivates.fetch_add(1, Ordering::SeqCst);
        self.unlinked(payload.ino)
    }

    async fn reclaim(&self, _vnode: &Vnode<Self>, payload: MemNode) -> Result<(), MemFsError> {
        self.delay().await;
        self.counters.reclaims.fetch_add(1, Ordering::SeqCst);
        if self.unlinked(payload.ino) {
            self.inodes.remove(&payload.ino);
        }
        Ok(())
    }

    async fn invalidate_cached_data(
        &self,
        _vnode: &Vnode<Self>,
        payload: &mut MemNode,
        mode: InvalidateMode,
    ) -> Result<(), MemFsError> {
        self.delay().await;
        match mode {
            InvalidateMode::Flush => {
                if self.fail_flush.load(Ordering::SeqCst) {
                    return Err(MemFsError::FlushRejected(payload.ino));
                }
                if payload.dirty {
                    self.counters.flushes.fetch_add(1, Ordering::SeqCst);
                }
            }
            InvalidateMode::Discard => {
                self.counters.discards.fetch_add(1, Ordering::SeqCst);
            }
        }
        payload.dirty = false;
        Ok(())
    }
}
