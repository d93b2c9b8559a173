#[macro_use]
pub mod macros;

pub mod blob;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod layout;
pub mod util;

mod store;

pub use blob::{BlobClient, BlobError, BlobRef, HashAlgorithm, HttpBlobClient, MemoryBlobStore, SizedBlobRef};
pub use config::StoreConfig;
pub use descriptor::TorrentDescriptor;
pub use error::{Result, StoreError};
pub use layout::{PieceAddress, PieceHash, PieceLayout};
pub use store::{PieceStore, VerifyReport};

/// Block size used by the transfer protocol when requesting pieces
pub const DEFAULT_BLOCK_SIZE: usize = 16_384;
