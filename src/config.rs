/// Configuration for a delta memstore
#[derive(Debug, Clone)]
pub struct DeltaStoreConfig {
    /// Capacity of the first arena chunk (default: 4KB)
    pub arena_chunk_size: usize,

    /// Upper bound for arena chunk growth (default: 1MB)
    pub arena_max_chunk_size: usize,

    /// Memory limit enforced by the store's tracker (default: unlimited)
    pub memory_limit: Option<usize>,

    /// Footprint at which the store asks to be flushed (default: 32MB)
    pub flush_threshold: usize,
}

impl Default for DeltaStoreConfig {
    fn default() -> Self {
        Self {
            arena_chunk_size: 4 * 1024,
            arena_max_chunk_size: 1024 * 1024,
            memory_limit: None,
            flush_threshold: 32 * 1024 * 1024,
        }
    }
}

impl DeltaStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial arena chunk size
    pub fn arena_chunk_size(mut self, size: usize) -> Self {
        self.arena_chunk_size = size;
        self
    }

    /// Set the maximum arena chunk size
    pub fn arena_max_chunk_size(mut self, size: usize) -> Self {
        self.arena_max_chunk_size = size;
        self
    }

    /// Limit the memory the store may consume
    pub fn memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Set the flush threshold
    pub fn flush_threshold(mut self, size: usize) -> Self {
        self.flush_threshold = size;
        self
    }
}
