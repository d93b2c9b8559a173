use std::num::NonZeroUsize;

/// Tunables of a [`PieceStore`](crate::PieceStore).
///
/// Every cached piece stays in memory for the lifetime of the store unless a limit is set.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Upper bound for the total size of cached pieces, in bytes
    pub max_cached_bytes: Option<usize>,
    /// Upper bound for the number of cached pieces
    pub max_cached_pieces: Option<NonZeroUsize>,
}

impl StoreConfig {
    pub fn with_max_cached_bytes(mut self, max_cached_bytes: usize) -> Self {
        self.max_cached_bytes = Some(max_cached_bytes);
        self
    }

    pub fn with_max_cached_pieces(mut self, max_cached_pieces: NonZeroUsize) -> Self {
        self.max_cached_pieces = Some(max_cached_pieces);
        self
    }
}
