use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced to callers of the vnode cache.
///
/// Internal-consistency violations (use count underflow, a driver failing to
/// reclaim an object it agreed to recycle) are not represented here; they
/// panic, since continuing would operate on corrupted shared state.
#[derive(Debug, Error)]
pub enum VnodeError {
    /// The key resolved to an object that is being, or has been, reclaimed.
    #[error("vnode not found")]
    NotFound,

    /// A rekey target collides with a live cache entry.
    #[error("vnode key already exists")]
    AlreadyExists,

    /// A non-blocking operation could not complete immediately.
    #[error("vnode busy")]
    Busy,

    /// Propagated verbatim from the file-system driver.
    #[error("driver error: {0}")]
    Driver(#[source] BoxError),

    /// The deferred release worker is no longer running.
    #[error("vnode cache is shut down")]
    ShutDown,
}

impl VnodeError {
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        VnodeError::Driver(Box::new(err))
    }

    /// Borrow the driver error as its concrete type, if it is one.
    pub fn driver_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            VnodeError::Driver(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn to_errno(&self) -> i32 {
        match self {
            VnodeError::NotFound => libc::ENOENT,
            VnodeError::AlreadyExists => libc::EEXIST,
            VnodeError::Busy => libc::EBUSY,
            VnodeError::Driver(_) => libc::EIO,
            VnodeError::ShutDown => libc::ESHUTDOWN,
        }
    }
}
