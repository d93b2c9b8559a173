use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::config::StoreConfig;
use crate::Result;

/// Fully downloaded or freshly committed pieces, keyed by piece index
pub(super) struct PieceCache {
    inner: Mutex<CacheInner>,
    max_cached_bytes: Option<usize>,
}

struct CacheInner {
    pieces: LruCache<u32, Bytes>,
    cached_bytes: usize,
    // Serializes fetches of the same piece
    fetch_locks: HashMap<u32, Arc<Mutex<()>>>,
}

impl PieceCache {
    pub(super) fn new(config: &StoreConfig) -> Self {
        let pieces = match config.max_cached_pieces {
            Some(max_cached_pieces) => LruCache::new(max_cached_pieces),
            None => LruCache::unbounded(),
        };

        PieceCache {
            inner: Mutex::new(CacheInner {
                pieces,
                cached_bytes: 0,
                fetch_locks: HashMap::new(),
            }),
            max_cached_bytes: config.max_cached_bytes,
        }
    }

    pub(super) async fn get(&self, index: u32) -> Option<Bytes> {
        self.inner.lock().await.pieces.get(&index).cloned()
    }

    pub(super) async fn insert(&self, index: u32, piece: Bytes) {
        let mut inner = self.inner.lock().await;
        self.insert_locked(&mut inner, index, piece);
    }

    /// Returns the cached piece, calling `fetch` to get it on a miss.
    ///
    /// At most one `fetch` per piece index is in flight at any time, concurrent callers wait for it
    /// to finish and then use its result. Nothing is cached if `fetch` fails.
    pub(super) async fn get_or_fetch<F, Fut>(&self, index: u32, fetch: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let fetch_lock = {
            let mut inner = self.inner.lock().await;
            if let Some(piece) = inner.pieces.get(&index) {
                return Ok(piece.clone());
            }
            inner.fetch_locks.entry(index).or_default().clone()
        };

        let _fetch_guard = fetch_lock.lock().await;

        // Somebody else could have fetched the piece while we were waiting
        if let Some(piece) = self.get(index).await {
            return Ok(piece);
        }

        let piece = fetch().await?;
        self.insert(index, piece.clone()).await;

        Ok(piece)
    }

    pub(super) async fn len(&self) -> usize {
        self.inner.lock().await.pieces.len()
    }

    pub(super) async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.pieces.clear();
        inner.cached_bytes = 0;
    }

    fn insert_locked(&self, inner: &mut CacheInner, index: u32, piece: Bytes) {
        let piece_size = piece.len();
        if self.max_cached_bytes.is_some_and(|max_cached_bytes| piece_size > max_cached_bytes) {
            tracing::trace!(index, piece_size, "piece is larger than the cache, not caching it");
            return;
        }

        // `push` reports both a replaced entry and an entry evicted because of the piece limit
        if let Some((_, replaced)) = inner.pieces.push(index, piece) {
            inner.cached_bytes -= replaced.len();
        }
        inner.cached_bytes += piece_size;

        if let Some(max_cached_bytes) = self.max_cached_bytes {
            while inner.cached_bytes > max_cached_bytes {
                let Some((evicted_idx, evicted)) = inner.pieces.pop_lru() else {
                    break;
                };
                tracing::trace!(index = evicted_idx, "evicting piece from the cache");
                inner.cached_bytes -= evicted.len();
            }
        }
    }
}
