//! Foreign storage: data wrappers, the chunk-fetch manager, the refresh
//! engine, and the refresh scheduler.
//!
//! Query execution addresses external tabular data exclusively through
//! chunk keys; this crate turns those requests into the right bytes with
//! the right metadata, memoized by the disk cache in `strata-cache` and
//! reconciled with the source by refreshes.

pub mod manager;
pub mod refresh;
pub mod scheduler;
pub mod wrapper;

pub use manager::{BufferMgr, ForeignStorageMgr};
pub use refresh::{refresh_foreign_table, refresh_foreign_tables, MAX_REFRESH_TIME};
pub use scheduler::RefreshScheduler;
pub use wrapper::{DataWrapper, MockDataWrapper};
