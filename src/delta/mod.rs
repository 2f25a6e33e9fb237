//! Building blocks of the delta memstore: the key, the concurrent index,
//! flush statistics and the flush sink.

pub mod key;
pub mod stats;
pub mod tree;
pub mod writer;

pub use key::{DeltaKey, RowId};
pub use stats::{DeltaStats, DeltaStatsCollector};
pub use tree::{DeltaTree, TreeCursor};
pub use writer::{BufferedDeltaWriter, DeltaFileWriter};
