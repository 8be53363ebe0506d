use std::future::Future;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawn a long-lived background task inside a span carrying its name, so
/// worker log lines can be told apart.
pub fn spawn_named<T, F>(name: &'static str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    // tokio::task::Builder needs tokio_unstable; the span carries the name instead
    tokio::spawn(future.instrument(tracing::info_span!("task", name)))
}
