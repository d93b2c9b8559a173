//! Content-addressed blob server contract.
//!
//! Pieces live in the blob server under their SHA-1 blobref, i.e. `sha1-<hex digest>`.
//! Since the torrent descriptor already carries SHA-1 piece hashes, a piece's blobref can be
//! derived without having its data.

mod http;
mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::mpsc;

pub use http::HttpBlobClient;
pub use memory::MemoryBlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
}

impl HashAlgorithm {
    fn prefix(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
        }
    }
}

/// Address of a blob in the blob server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef {
    algorithm: HashAlgorithm,
    digest: [u8; 20],
}

impl BlobRef {
    pub fn from_sha1_digest(digest: [u8; 20]) -> Self {
        BlobRef {
            algorithm: HashAlgorithm::Sha1,
            digest,
        }
    }

    pub fn sha1_from_bytes(data: &[u8]) -> Self {
        BlobRef::from_sha1_digest(Sha1::digest(data).into())
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8; 20] {
        &self.digest
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.prefix(), hex::encode(self.digest))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlobRefParseError {
    #[error("blobref is missing the '-' separator: {0}")]
    MissingSeparator(String),
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("bad blobref digest: {0}")]
    BadDigest(String),
}

impl FromStr for BlobRef {
    type Err = BlobRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s
            .split_once('-')
            .ok_or_else(|| BlobRefParseError::MissingSeparator(s.to_string()))?;

        match algorithm {
            "sha1" => {
                let mut decoded = [0; 20];
                hex::decode_to_slice(digest, &mut decoded)
                    .map_err(|_| BlobRefParseError::BadDigest(digest.to_string()))?;
                Ok(BlobRef::from_sha1_digest(decoded))
            }
            other => Err(BlobRefParseError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A blobref together with the size of the blob, as reported by the blob server
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SizedBlobRef {
    #[serde(rename = "blobRef")]
    #[serde_as(as = "DisplayFromStr")]
    pub blob_ref: BlobRef,
    pub size: u64,
}

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob {0} doesn't exist")]
    NotFound(BlobRef),
    #[error("blob server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response from the blob server: {0}")]
    BadResponse(String),
    #[error("blob {blob_ref} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        blob_ref: BlobRef,
        expected: usize,
        actual: usize,
    },
    #[error("blob server returned data hashing to {actual} for {expected}")]
    DigestMismatch { expected: BlobRef, actual: BlobRef },
    #[error("the receiver of existing blobrefs was dropped")]
    ReceiverDropped,
    #[error("blob server is unavailable: {0}")]
    Unavailable(String),
}

/// Client side of a content-addressed blob server.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Retrieves the whole blob
    async fn fetch(&self, blob_ref: &BlobRef) -> Result<Bytes, BlobError>;

    /// Stores `data`, returning the blobref the server assigned to it
    async fn receive_blob(&self, blob_ref: &BlobRef, data: Bytes) -> Result<SizedBlobRef, BlobError>;

    /// Sends every blob from `blob_refs` that exists in the server to `existing`.
    ///
    /// Returning (and thus dropping `existing`) marks the end of the batch.
    async fn stat_blobs(&self, blob_refs: &[BlobRef], existing: mpsc::Sender<SizedBlobRef>)
        -> Result<(), BlobError>;
}
