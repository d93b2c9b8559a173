use std::fmt::Debug;
use std::result;

use thiserror::Error;

use crate::blob::{BlobError, BlobRef};

pub type Result<T> = result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{length} bytes at offset {offset} don't fit into a single piece of the content")]
    OutOfRange { offset: u64, length: usize },
    #[error("wrong piece index: {index}. Total number of pieces: {count}")]
    NoSuchPiece { index: u64, count: u32 },
    #[error("unexpected non-zero data at the end of the content after {written} bytes")]
    CorruptPadding { written: usize },
    #[error("failed to fetch piece {index} ({blob_ref}) from the blob server")]
    FetchFailed {
        index: u32,
        blob_ref: BlobRef,
        #[source]
        source: BlobError,
    },
    #[error("failed to commit {blob_ref} to the blob server")]
    CommitFailed {
        blob_ref: BlobRef,
        #[source]
        source: BlobError,
    },
    #[error("expected blobref {expected}, blob server assigned {actual}")]
    AddressMismatch { expected: BlobRef, actual: BlobRef },
    #[error("failed to check the existence of {count} blobs")]
    BatchRequestFailed {
        count: usize,
        #[source]
        source: BlobError,
    },
    #[error("an error happened: {0}")]
    InternalError(&'static str),
}

impl StoreError {
    /// Whether a higher layer can recover by re-acquiring the piece or retrying the request.
    /// Range errors are caller bugs.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StoreError::OutOfRange { .. } | StoreError::NoSuchPiece { .. } | StoreError::InternalError(_)
        )
    }
}
