use super::{ReleaseMode, ReleaseOrigin, Vnode, VnodeCache};
use crate::driver::FsDriver;
use crate::errors::VnodeError;
use crate::task::spawn_named;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) enum ReleaseRequest<D: FsDriver> {
    /// A vnode whose last reference was handed off, still counted.
    Release(Arc<Vnode<D>>),
    /// Answered once everything queued before it has been processed.
    Flush(oneshot::Sender<()>),
}

/// Runs deactivation for releases that could not, or would not, do it
/// inline.
pub(crate) struct ReleaseWorker<D: FsDriver> {
    cache: Arc<VnodeCache<D>>,
}

impl<D: FsDriver> ReleaseWorker<D> {
    pub fn new(cache: Arc<VnodeCache<D>>) -> Self {
        Self { cache }
    }

    pub fn spawn(
        self,
        mut release_rx: mpsc::UnboundedReceiver<ReleaseRequest<D>>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        spawn_named("vnode-release", async move {
            info!("Deferred release worker started");

            loop {
                tokio::select! {
                    request = release_rx.recv() => {
                        match request {
                            Some(request) => self.handle(request).await,
                            None => {
                                info!("Release channel closed, stopping worker");
                                break;
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        // late senders get an error and park the vnode themselves
                        release_rx.close();
                        let mut drained = 0usize;
                        while let Some(request) = release_rx.recv().await {
                            self.handle(request).await;
                            drained += 1;
                        }
                        info!("Shutdown signal received, processed {} queued releases", drained);
                        break;
                    }
                }
            }

            info!("Deferred release worker stopped");
        })
    }

    async fn handle(&self, request: ReleaseRequest<D>) {
        match request {
            ReleaseRequest::Release(vnode) => {
                debug!(serial = vnode.serial(), "Deferred release");
                self.cache
                    .vrele(vnode, ReleaseMode::Sync, ReleaseOrigin::Worker)
                    .await;
            }
            ReleaseRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl<D: FsDriver> VnodeCache<D> {
    /// Wait until every release deferred before this call has been handled.
    pub async fn flush_releases(&self) -> Result<(), VnodeError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.release_tx
            .send(ReleaseRequest::Flush(done_tx))
            .map_err(|_| VnodeError::ShutDown)?;
        done_rx.await.map_err(|_| VnodeError::ShutDown)
    }
}
