pub use fail::fail_point;

pub const LOAD_BEFORE_DRIVER: &str = "load_before_driver";
pub const LOAD_AFTER_DRIVER: &str = "load_after_driver";

pub const CREATE_BEFORE_DRIVER: &str = "create_before_driver";

pub const RECLAIM_AFTER_XLOCK: &str = "reclaim_after_xlock";
pub const RECLAIM_AFTER_INVALIDATE: &str = "reclaim_after_invalidate";

pub const RELEASE_BEFORE_DEACTIVATE: &str = "release_before_deactivate";

pub const DRAIN_AFTER_VICTIM: &str = "drain_after_victim";
