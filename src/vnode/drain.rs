use super::{ReleaseMode, ReleaseOrigin, VnodeCache};
use crate::config::DrainConfig;
use crate::driver::FsDriver;
use crate::errors::VnodeError;
use crate::stats::VnodeStats;
use crate::task::spawn_named;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "failpoints")]
use crate::failpoints as fp;

/// Keeps the live vnode count at or under the desired threshold by
/// reclaiming parked vnodes.
pub(crate) struct DrainWorker<D: FsDriver> {
    cache: Arc<VnodeCache<D>>,
    interval: Duration,
    backoff: Duration,
}

impl<D: FsDriver> DrainWorker<D> {
    pub fn new(cache: Arc<VnodeCache<D>>, config: &DrainConfig) -> Self {
        Self {
            cache,
            interval: config.interval(),
            backoff: config.backoff(),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        spawn_named("vnode-drain", async move {
            info!(
                "Drain worker started: interval={}ms, backoff={}ms",
                self.interval.as_millis(),
                self.backoff.as_millis()
            );

            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.cache.alloc.drain_signal().notified() => {
                        debug!("Drain signaled");
                    }
                    _ = shutdown.cancelled() => {
                        info!("Shutdown signal received, stopping drain worker");
                        break;
                    }
                }
                self.drain(&shutdown).await;
            }

            info!("Drain worker stopped");
        })
    }

    async fn drain(&self, shutdown: &CancellationToken) {
        while self.cache.alloc.over_target() && !shutdown.is_cancelled() {
            if self.cache.clean_one().await.is_err() {
                debug!(
                    "No drain victim available ({} live, {} desired), backing off",
                    self.cache.numvnodes(),
                    self.cache.desired_vnodes()
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

/// Counts a victim in flight until it has been released again, including
/// when the cleaning future is dropped.
struct Cleaning<'a, D: FsDriver> {
    cache: &'a VnodeCache<D>,
}

impl<'a, D: FsDriver> Cleaning<'a, D> {
    fn enter(cache: &'a VnodeCache<D>) -> Self {
        cache.cleaning.fetch_add(1, Ordering::AcqRel);
        Self { cache }
    }
}

impl<D: FsDriver> Drop for Cleaning<'_, D> {
    fn drop(&mut self) {
        self.cache.cleaning.fetch_sub(1, Ordering::AcqRel);
        self.cache.cleaned.notify_waiters();
    }
}

impl<D: FsDriver> VnodeCache<D> {
    /// Reclaim one victim from the free lists. `Busy` if none is available.
    pub(crate) async fn clean_one(&self) -> Result<(), VnodeError> {
        let cleaning = Cleaning::enter(self);
        let Some((vnode, busy)) = self.freelists.take_victim() else {
            return Err(VnodeError::Busy);
        };

        #[cfg(feature = "failpoints")]
        fp::fail_point!(fp::DRAIN_AFTER_VICTIM);

        let reclaimed = {
            let mut data = vnode.data.write().await;
            if vnode.begin_change().await {
                // someone may have taken it back while we waited for the lock
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
        drop(busy);
        if reclaimed {
            VnodeStats::bump(&self.stats.drained);
        }
        self.vrele(vnode, ReleaseMode::Sync, ReleaseOrigin::Worker).await;
        drop(cleaning);
        Ok(())
    }

    /// Reclaim parked vnodes until at most `target` are live.
    ///
    /// Fails with `Busy` once the free lists hold nothing reclaimable and no
    /// other drainer has a victim in flight, which happens when the
    /// remaining vnodes are all referenced.
    pub async fn drain_to(&self, target: usize) -> Result<(), VnodeError> {
        while self.numvnodes() > target {
            let cleaned = self.cleaned.notified();
            match self.clean_one().await {
                Ok(()) => {}
                Err(VnodeError::Busy) if self.cleaning.load(Ordering::Acquire) > 0 => {
                    debug!("Waiting for victims in flight elsewhere");
                    cleaned.await;
                }
                // another drainer may have finished the job meanwhile
                Err(VnodeError::Busy) if self.numvnodes() <= target => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Install a new desired vnode count and drain down to it. On failure
    /// the previous threshold is restored.
    pub async fn set_desired_vnodes(&self, desired: usize) -> Result<(), VnodeError> {
        let previous = self.alloc.set_desired(desired);
        if let Err(e) = self.drain_to(desired).await {
            self.alloc.set_desired(previous);
            warn!(
                "Could not drain to {} vnodes ({} live), keeping {}",
                desired,
                self.numvnodes(),
                previous
            );
            return Err(e);
        }
        info!("Desired vnodes changed from {} to {}", previous, desired);
        Ok(())
    }
}
