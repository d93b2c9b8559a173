use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::blob::{BlobRef, SizedBlobRef};
use crate::layout::PieceHash;
use crate::util::Elapsed;
use crate::{Result, StoreError};

use super::{PendingPiece, PieceStore};

const STAT_CHANNEL_CAPACITY: usize = 64;
const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_secs(5);

/// Outcome of a [`PieceStore::verify_pieces`] call
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Whether the blob server holds a piece with this hash now
    pub verified: HashMap<PieceHash, bool>,
    /// Pieces that matched their hash but couldn't be stored in the blob server
    pub commit_failures: Vec<(PieceHash, StoreError)>,
    /// Set when the existence check failed, the pieces it covered are missing from `verified`
    pub batch_error: Option<StoreError>,
}

impl VerifyReport {
    pub fn is_verified(&self, piece_hash: &PieceHash) -> Option<bool> {
        self.verified.get(piece_hash).copied()
    }

    pub fn verified_count(&self) -> usize {
        self.verified.values().filter(|verified| **verified).count()
    }

    pub fn unverified_count(&self) -> usize {
        self.verified.len() - self.verified_count()
    }
}

impl PieceStore {
    /// Checks which pieces are available in the blob server, committing pending ones first.
    ///
    /// Every pending piece expected to hash to one of `piece_hashes` is taken out of the pending set.
    /// Pieces whose data matches the hash are stored in the blob server, the rest are discarded and
    /// have to be written again. Hashes without any pending piece are looked up in the blob server
    /// with a single batched request.
    #[tracing::instrument(level = "error", skip_all, fields(pieces = piece_hashes.len()))]
    pub async fn verify_pieces(&self, piece_hashes: &[PieceHash]) -> VerifyReport {
        let mut report = VerifyReport::default();
        let mut seen = HashSet::with_capacity(piece_hashes.len());
        let mut unresolved = Vec::new();

        for piece_hash in piece_hashes.iter().filter(|piece_hash| seen.insert(**piece_hash)) {
            let mut resolved = None;

            for &index in self.layout.indices_of(piece_hash) {
                let Some((_, pending)) = self.pending.remove(&index) else {
                    continue;
                };

                // Identical pieces are stored once
                if resolved == Some(true) {
                    tracing::trace!(index, "dropping a duplicate of an already committed piece");
                    continue;
                }

                match self.verify_and_commit(index, piece_hash, pending).await {
                    Ok(committed) => resolved = Some(committed || resolved.unwrap_or_default()),
                    Err(e) => {
                        tracing::warn!(index, "failed to commit a piece: {e:#}");
                        report.commit_failures.push((*piece_hash, e));
                        resolved.get_or_insert(false);
                    }
                }
            }

            match resolved {
                Some(verified) => {
                    report.verified.insert(*piece_hash, verified);
                }
                None => unresolved.push(*piece_hash),
            }
        }

        if unresolved.is_empty() {
            return report;
        }

        match self.stat_remote(&unresolved).await {
            Ok(existing) => report.verified.extend(
                unresolved
                    .iter()
                    .map(|piece_hash| (*piece_hash, existing.contains(piece_hash))),
            ),
            Err(e) => {
                tracing::warn!("existence check failed: {e:#}");
                report.batch_error = Some(e);
            }
        }

        report
    }

    /// [`PieceStore::verify_pieces`] for every piece of the torrent
    pub async fn verify_all(&self) -> VerifyReport {
        self.verify_pieces(self.layout.piece_hashes()).await
    }

    async fn verify_and_commit(&self, index: u32, expected: &PieceHash, pending: PendingPiece) -> Result<bool> {
        let piece = pending.into_bytes();
        let expected = BlobRef::from_sha1_digest(*expected);

        let actual = BlobRef::sha1_from_bytes(&piece);
        if actual != expected {
            tracing::debug!(index, %expected, %actual, "piece hash mismatch, discarding the piece");
            return Ok(false);
        }

        let received = self
            .client
            .receive_blob(&expected, piece.clone())
            .with_elapsed("piece commit", Some(SLOW_COMMIT_THRESHOLD))
            .await
            .map_err(|source| StoreError::CommitFailed {
                blob_ref: expected,
                source,
            })?;

        if received.blob_ref != expected {
            return Err(StoreError::AddressMismatch {
                expected,
                actual: received.blob_ref,
            });
        }

        tracing::debug!(index, blob_ref = %expected, "committed piece to the blob server");
        self.cache.insert(index, piece).await;

        Ok(true)
    }

    /// Hashes from `piece_hashes` that the blob server already has
    async fn stat_remote(&self, piece_hashes: &[PieceHash]) -> Result<HashSet<PieceHash>> {
        let blob_refs = piece_hashes
            .iter()
            .map(|piece_hash| BlobRef::from_sha1_digest(*piece_hash))
            .collect::<Vec<_>>();

        let (tx, mut rx) = mpsc::channel::<SizedBlobRef>(STAT_CHANNEL_CAPACITY);
        // Runs until the client drops the sender
        let collector = tokio::spawn(async move {
            let mut existing = HashSet::new();
            while let Some(sized_blob_ref) = rx.recv().await {
                existing.insert(*sized_blob_ref.blob_ref.digest());
            }
            existing
        });

        if let Err(source) = self
            .client
            .stat_blobs(&blob_refs, tx)
            .with_elapsed("existence check", None)
            .await
        {
            collector.abort();
            return Err(StoreError::BatchRequestFailed {
                count: blob_refs.len(),
                source,
            });
        }

        collector
            .await
            .map_err(|_| StoreError::InternalError("existence check collector failed"))
    }
}
