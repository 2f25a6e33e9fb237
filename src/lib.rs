pub mod arena;
pub mod changelist;
pub mod config;
pub mod delta;
pub mod encoding;
pub mod error;
pub mod hybrid_time;
pub mod iterator;
pub mod log_anchor;
pub mod memstore;
pub mod mvcc;
pub mod rowblock;
pub mod schema;

pub use arena::{Arena, MemTracker};
pub use config::DeltaStoreConfig;
pub use delta::{DeltaFileWriter, DeltaKey, DeltaStats, RowId};
pub use error::{Error, Result};
pub use hybrid_time::HybridTime;
pub use iterator::{DmsIterator, PrepareFlag, ScanSpec};
pub use memstore::DeltaMemStore;
pub use mvcc::MvccSnapshot;
