//! Content-addressed storage for uploaded files.
//!
//! Blobs are keyed by the SHA-256 of their bytes and laid out in a two-level
//! hex-sharded tree:
//!
//! ```text
//! {root}/{aa}/{bb}/{64-hex-key}[.ext]
//! {base_url}/{aa}/{bb}/{64-hex-key}[.ext]
//! ```
//!
//! The store knows nothing about which records reference a file. Garbage
//! collection ([`OrphanCollector`]) rebuilds that set from the outside and
//! deletes unreferenced keys once they are older than a grace TTL.

mod fs;
mod gc;
mod key;
mod middleware;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::io::AsyncRead;

pub use fs::FsContentStore;
pub use gc::{OrphanCollector, OrphanReport, ReferenceSource};
pub use key::{keys_from_urls, normalize_extension, ContentKey, ContentKeyError, KEY_LEN};
pub use middleware::FileLifecycleMiddleware;

/// Readable byte source for an upload.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O operation on the store failed.
    #[error("content store I/O failed at {}: {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid file extension {0:?}")]
    InvalidExtension(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StorageIo {
            path: path.into(),
            source,
        }
    }
}

/// Result of [`ContentStore::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedContent {
    pub key: ContentKey,
    pub extension: Option<String>,
    pub url: String,
    pub size: u64,
    /// `false` when identical content was already present.
    pub created: bool,
}

/// One file found while listing the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: ContentKey,
    pub extension: Option<String>,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Deduplicating blob storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Hash and persist the stream. Writing content that is already stored is
    /// a no-op that returns the same key.
    async fn save(
        &self,
        source: ByteStream,
        extension: Option<&str>,
    ) -> Result<SavedContent, StoreError>;

    async fn exists(&self, key: &ContentKey, extension: Option<&str>) -> Result<bool, StoreError>;

    fn url(&self, key: &ContentKey, extension: Option<&str>) -> String;

    /// Remove one variant of a key. Missing files are not an error.
    async fn delete(&self, key: &ContentKey, extension: Option<&str>) -> Result<(), StoreError>;

    /// Stream every stored file whose name is a content key.
    fn list_all_keys(&self) -> BoxStream<'_, Result<StoredObject, StoreError>>;
}
