use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use super::{BlobClient, BlobError, BlobRef, SizedBlobRef};

/// Blob server that lives in process memory
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobRef, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, data: impl Into<Bytes>) -> BlobRef {
        let data = data.into();
        let blob_ref = BlobRef::sha1_from_bytes(&data);
        self.blobs.write().await.insert(blob_ref, data);
        blob_ref
    }

    pub async fn contains(&self, blob_ref: &BlobRef) -> bool {
        self.blobs.read().await.contains_key(blob_ref)
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobClient for MemoryBlobStore {
    async fn fetch(&self, blob_ref: &BlobRef) -> Result<Bytes, BlobError> {
        self.blobs
            .read()
            .await
            .get(blob_ref)
            .cloned()
            .ok_or(BlobError::NotFound(*blob_ref))
    }

    async fn receive_blob(&self, _blob_ref: &BlobRef, data: Bytes) -> Result<SizedBlobRef, BlobError> {
        // The address is always derived from the received data, as a real blob server would do
        let size = data.len() as u64;
        let blob_ref = self.insert(data).await;
        Ok(SizedBlobRef { blob_ref, size })
    }

    async fn stat_blobs(
        &self,
        blob_refs: &[BlobRef],
        existing: mpsc::Sender<SizedBlobRef>,
    ) -> Result<(), BlobError> {
        let found = {
            let blobs = self.blobs.read().await;
            blob_refs
                .iter()
                .filter_map(|blob_ref| {
                    blobs.get(blob_ref).map(|blob| SizedBlobRef {
                        blob_ref: *blob_ref,
                        size: blob.len() as u64,
                    })
                })
                .collect::<Vec<_>>()
        };

        for sized_blob_ref in found {
            existing
                .send(sized_blob_ref)
                .await
                .map_err(|_| BlobError::ReceiverDropped)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_blobs_under_their_sha1() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"piece data");
        let expected = BlobRef::sha1_from_bytes(&data);

        let received = store
            .receive_blob(&expected, data.clone())
            .await
            .expect("failed to receive a blob");

        assert_eq!(received.blob_ref, expected);
        assert_eq!(received.size, data.len() as u64);
        assert_eq!(store.fetch(&expected).await.expect("failed to fetch a blob"), data);
    }

    #[tokio::test]
    async fn fetching_a_missing_blob_fails() {
        let store = MemoryBlobStore::new();
        let missing = BlobRef::sha1_from_bytes(b"missing");
        assert!(matches!(store.fetch(&missing).await, Err(BlobError::NotFound(blob_ref)) if blob_ref == missing));
    }

    #[tokio::test]
    async fn stat_reports_only_existing_blobs() {
        let store = MemoryBlobStore::new();
        let existing = store.insert(&b"existing"[..]).await;
        let missing = BlobRef::sha1_from_bytes(b"missing");

        let (tx, mut rx) = mpsc::channel(4);
        store
            .stat_blobs(&[missing, existing], tx)
            .await
            .expect("stat request failed");

        assert_eq!(rx.recv().await.map(|sized| sized.blob_ref), Some(existing));
        // The sender was dropped together with the call
        assert_eq!(rx.recv().await, None);
    }
}
