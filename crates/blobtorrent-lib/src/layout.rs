use std::collections::HashMap;
use std::sync::Arc;

use crate::blob::BlobRef;
use crate::descriptor::TorrentDescriptor;
use crate::util::piece_size_from_idx;
use crate::{Result, StoreError};

/// SHA1 hash of a piece, as listed in the torrent's info dictionary
pub type PieceHash = [u8; 20];

/// Position of a byte inside the torrent's pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceAddress {
    pub index: u32,
    /// Offset into the piece
    pub offset: usize,
}

/// Maps flat content offsets onto pieces and pieces onto their blobrefs
#[derive(Debug, Clone)]
pub struct PieceLayout {
    piece_length: usize,
    total_length: u64,
    piece_hashes: Arc<[PieceHash]>,
    // Pieces with identical data share the same hash
    indices_by_hash: Arc<HashMap<PieceHash, Vec<u32>>>,
}

impl PieceLayout {
    pub fn new(descriptor: &TorrentDescriptor) -> Self {
        let mut indices_by_hash: HashMap<PieceHash, Vec<u32>> = HashMap::new();
        for (idx, piece_hash) in descriptor.piece_hashes().iter().enumerate() {
            // The descriptor guarantees that the number of pieces fits into u32
            indices_by_hash.entry(*piece_hash).or_default().push(idx as u32);
        }

        PieceLayout {
            // Checked by the descriptor as well
            piece_length: descriptor.piece_length() as usize,
            total_length: descriptor.total_length(),
            piece_hashes: descriptor.piece_hashes().into(),
            indices_by_hash: Arc::new(indices_by_hash),
        }
    }

    pub fn number_of_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_length(&self) -> usize {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_hashes(&self) -> &[PieceHash] {
        &self.piece_hashes
    }

    /// Exact size of the piece. Only the last one can be shorter than the piece length
    pub fn piece_size(&self, index: u32) -> Result<usize> {
        self.check_index(index)?;
        Ok(piece_size_from_idx(
            self.number_of_pieces(),
            self.total_length,
            self.piece_length,
            index,
        ))
    }

    pub fn piece_hash(&self, index: u32) -> Result<&PieceHash> {
        self.check_index(index)?;
        Ok(&self.piece_hashes[index as usize])
    }

    pub fn blob_ref(&self, index: u32) -> Result<BlobRef> {
        self.piece_hash(index).map(|piece_hash| BlobRef::from_sha1_digest(*piece_hash))
    }

    /// Indices of all pieces that are expected to hash to `piece_hash`
    pub fn indices_of(&self, piece_hash: &PieceHash) -> &[u32] {
        self.indices_by_hash
            .get(piece_hash)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Index of the piece that holds `offset`, which doesn't have to be valid
    pub(crate) fn piece_index_of(&self, offset: u64) -> u64 {
        offset / self.piece_length as u64
    }

    /// Resolves a request of `length` bytes at `offset`.
    ///
    /// Requests must stay within a single piece and start inside the content. The end of the request
    /// may go past the end of the content as long as it stays within the piece length, as the
    /// content is zero-padded up to the piece boundary.
    pub fn resolve(&self, offset: u64, length: usize) -> Result<PieceAddress> {
        if offset >= self.total_length {
            return Err(StoreError::OutOfRange { offset, length });
        }
        self.resolve_padded(offset, length)
    }

    /// Like [`PieceLayout::resolve`], but the request may also start in the zero padding of the last
    /// piece, as long as it ends before the piece boundary.
    pub fn resolve_padded(&self, offset: u64, length: usize) -> Result<PieceAddress> {
        let out_of_range = || StoreError::OutOfRange { offset, length };

        let index = self.piece_index_of(offset);
        if index >= self.number_of_pieces() as u64 {
            return Err(out_of_range());
        }

        let offset_into_piece = (offset % self.piece_length as u64) as usize;
        match offset_into_piece.checked_add(length) {
            Some(end) if end <= self.piece_length => Ok(PieceAddress {
                index: index as u32,
                offset: offset_into_piece,
            }),
            _ => Err(out_of_range()),
        }
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.number_of_pieces() {
            return Err(StoreError::NoSuchPiece {
                index: index as u64,
                count: self.number_of_pieces(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(piece_length: u64, total_length: u64) -> PieceLayout {
        let number_of_pieces = total_length.div_ceil(piece_length) as usize;
        let piece_hashes = (0..number_of_pieces).map(|idx| [idx as u8; 20]).collect();
        let descriptor = TorrentDescriptor::new([0; 20], piece_length, total_length, piece_hashes)
            .expect("failed to create a descriptor");
        PieceLayout::new(&descriptor)
    }

    #[test]
    fn piece_sizes() {
        let layout = layout(4, 10);
        assert_eq!(layout.number_of_pieces(), 3);
        let sizes = (0..3)
            .map(|idx| layout.piece_size(idx).expect("valid index"))
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(matches!(
            layout.piece_size(3),
            Err(StoreError::NoSuchPiece { index: 3, count: 3 })
        ));
    }

    #[test]
    fn last_piece_is_full_when_content_divides_evenly() {
        let layout = layout(4, 12);
        assert_eq!(layout.piece_size(2).expect("valid index"), 4);
    }

    #[test]
    fn resolves_offsets() {
        let layout = layout(4, 10);
        assert_eq!(
            layout.resolve(0, 4).expect("valid range"),
            PieceAddress { index: 0, offset: 0 }
        );
        assert_eq!(
            layout.resolve(5, 3).expect("valid range"),
            PieceAddress { index: 1, offset: 1 }
        );
        assert_eq!(
            layout.resolve(8, 2).expect("valid range"),
            PieceAddress { index: 2, offset: 0 }
        );
        // Zero padding up to the piece boundary
        assert_eq!(
            layout.resolve(9, 3).expect("valid range"),
            PieceAddress { index: 2, offset: 1 }
        );
    }

    #[test]
    fn rejects_bad_ranges() {
        let layout = layout(4, 10);
        // Spans two pieces
        assert!(matches!(layout.resolve(2, 3), Err(StoreError::OutOfRange { offset: 2, length: 3 })));
        // Starts past the end of the content
        assert!(matches!(layout.resolve(10, 2), Err(StoreError::OutOfRange { .. })));
        // Goes past the nominal size of the last piece
        assert!(matches!(layout.resolve(8, 5), Err(StoreError::OutOfRange { .. })));
        // No such piece
        assert!(matches!(layout.resolve(12, 1), Err(StoreError::OutOfRange { .. })));
    }

    #[test]
    fn padded_requests_may_start_past_the_content() {
        let layout = layout(4, 10);
        assert_eq!(
            layout.resolve_padded(10, 2).expect("valid padded range"),
            PieceAddress { index: 2, offset: 2 }
        );
        assert!(matches!(layout.resolve(10, 2), Err(StoreError::OutOfRange { .. })));
        assert!(matches!(layout.resolve_padded(10, 3), Err(StoreError::OutOfRange { .. })));
        assert!(matches!(layout.resolve_padded(12, 1), Err(StoreError::OutOfRange { .. })));
    }

    #[test]
    fn maps_hashes_to_indices() {
        let piece_hashes = vec![[1; 20], [2; 20], [1; 20]];
        let descriptor = TorrentDescriptor::new([0; 20], 4, 12, piece_hashes).expect("failed to create a descriptor");
        let layout = PieceLayout::new(&descriptor);

        assert_eq!(layout.indices_of(&[1; 20]), &[0, 2]);
        assert_eq!(layout.indices_of(&[2; 20]), &[1]);
        assert!(layout.indices_of(&[3; 20]).is_empty());
        assert_eq!(
            layout.blob_ref(1).expect("valid index"),
            BlobRef::from_sha1_digest([2; 20])
        );
    }
}
