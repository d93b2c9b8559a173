mod cache;
mod verify;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use crate::blob::{BlobClient, BlobError, BlobRef};
use crate::config::StoreConfig;
use crate::layout::PieceLayout;
use crate::util::Elapsed;
use crate::{Result, StoreError};

use self::cache::PieceCache;
pub use self::verify::VerifyReport;

const SLOW_FETCH_THRESHOLD: Duration = Duration::from_secs(5);

/// Piece that is being downloaded and wasn't verified yet
struct PendingPiece {
    data: Vec<u8>,
}

impl PendingPiece {
    fn new(piece_size: usize) -> Self {
        PendingPiece {
            data: vec![0; piece_size],
        }
    }

    /// Copies `buf` into the piece. Everything past the end of the piece must be zero padding.
    fn write_at(&mut self, buf: &[u8], offset: usize) -> Result<usize> {
        let in_piece = buf.len().min(self.data.len().saturating_sub(offset));
        self.data[offset..offset + in_piece].copy_from_slice(&buf[..in_piece]);

        if let Some(position) = buf[in_piece..].iter().position(|byte| *byte != 0) {
            return Err(StoreError::CorruptPadding {
                written: in_piece + position,
            });
        }

        Ok(buf.len())
    }

    fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }
}

/// Random access storage for the torrent's content that keeps pieces in a blob server.
///
/// Written data is buffered per piece until [`PieceStore::verify_pieces`] checks it against the
/// expected hash and commits it to the blob server. Reads are served from cached pieces, from
/// pending ones, or from the blob server.
pub struct PieceStore {
    layout: PieceLayout,
    client: Arc<dyn BlobClient>,
    pending: DashMap<u32, PendingPiece>,
    cache: PieceCache,
}

impl PieceStore {
    pub fn new(layout: PieceLayout, client: Arc<dyn BlobClient>, config: StoreConfig) -> Self {
        PieceStore {
            layout,
            client,
            pending: DashMap::new(),
            cache: PieceCache::new(&config),
        }
    }

    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    /// Reads `buf.len()` bytes at `offset`. The range must stay within one piece.
    ///
    /// The part of the range that lies past the end of the content is filled with zeros, so reads may
    /// start anywhere within the last piece's nominal length.
    #[tracing::instrument(level = "error", err(level = "debug"), skip(self, buf), fields(length = buf.len()))]
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_piece_index(offset)?;
        let address = self.layout.resolve_padded(offset, buf.len())?;

        if let Some(piece) = self.cache.get(address.index).await {
            return Ok(copy_with_padding(&piece, address.offset, buf));
        }

        if let Some(pending) = self.pending.get(&address.index) {
            return Ok(copy_with_padding(&pending.data, address.offset, buf));
        }

        let piece = self
            .cache
            .get_or_fetch(address.index, || self.fetch_piece(address.index))
            .await?;

        Ok(copy_with_padding(&piece, address.offset, buf))
    }

    /// Writes `buf` at `offset` into the piece's pending buffer. The range must stay within one piece.
    ///
    /// Bytes that go past the end of the content must be zero, as the content is zero-padded up to the
    /// piece boundary. On the first non-zero one [`StoreError::CorruptPadding`] is returned, with
    /// everything before it already written.
    #[tracing::instrument(level = "error", err(level = "debug"), skip(self, buf), fields(length = buf.len()))]
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.check_piece_index(offset)?;
        let address = self.layout.resolve(offset, buf.len())?;
        let piece_size = self.layout.piece_size(address.index)?;

        let mut pending = self.pending.entry(address.index).or_insert_with(|| {
            tracing::trace!(index = address.index, piece_size, "new pending piece");
            PendingPiece::new(piece_size)
        });

        pending.write_at(buf, address.offset)
    }

    /// Drops all buffered pieces. Pending pieces aren't committed.
    pub async fn close(&self) {
        let discarded = self.pending.len();
        self.pending.clear();
        self.cache.clear().await;

        if discarded > 0 {
            tracing::debug!(discarded, "closed the piece store with pending pieces");
        }
    }

    /// Number of pieces that were written to but not verified yet
    pub fn pending_pieces(&self) -> usize {
        self.pending.len()
    }

    pub async fn cached_pieces(&self) -> usize {
        self.cache.len().await
    }

    fn check_piece_index(&self, offset: u64) -> Result<()> {
        let index = self.layout.piece_index_of(offset);
        if index >= self.layout.number_of_pieces() as u64 {
            return Err(StoreError::NoSuchPiece {
                index,
                count: self.layout.number_of_pieces(),
            });
        }
        Ok(())
    }

    /// Downloads a piece and makes sure that it's the one we asked for
    async fn fetch_piece(&self, index: u32) -> Result<Bytes> {
        let blob_ref = self.layout.blob_ref(index)?;
        let piece_size = self.layout.piece_size(index)?;
        let fetch_failed = |source: BlobError| StoreError::FetchFailed {
            index,
            blob_ref,
            source,
        };

        let piece = self
            .client
            .fetch(&blob_ref)
            .with_elapsed("piece fetch", Some(SLOW_FETCH_THRESHOLD))
            .await
            .map_err(fetch_failed)?;

        if piece.len() != piece_size {
            return Err(fetch_failed(BlobError::SizeMismatch {
                blob_ref,
                expected: piece_size,
                actual: piece.len(),
            }));
        }

        let actual = BlobRef::sha1_from_bytes(&piece);
        if actual != blob_ref {
            return Err(fetch_failed(BlobError::DigestMismatch {
                expected: blob_ref,
                actual,
            }));
        }

        tracing::debug!(index, %blob_ref, "fetched piece from the blob server");
        Ok(piece)
    }
}

/// Copies the piece's data starting at `offset` and zero-fills the rest of `buf`
fn copy_with_padding(piece: &[u8], offset: usize, buf: &mut [u8]) -> usize {
    let available = piece.get(offset..).unwrap_or_default();
    let copied = available.len().min(buf.len());
    buf[..copied].copy_from_slice(&available[..copied]);
    buf[copied..].fill(0);
    buf.len()
}
