//! Commands carried through the pipeline.

use std::fmt;
use std::io::Cursor;

use tokio::io::AsyncRead;

use crate::content::{ByteStream, SavedContent};

/// A request to change state.
///
/// Commands are plain data. The pipeline only needs two things from them:
/// the client-supplied idempotency key, and access to an uploaded file if the
/// command carries one. See [`idempotency_key_field!`](crate::idempotency_key_field)
/// and [`upload_field!`](crate::upload_field) for one-line implementations.
pub trait Command: Send + 'static {
    /// Key identifying one logical write. `None` opts the command out of
    /// idempotent execution.
    fn idempotency_key(&self) -> Option<&str> {
        None
    }

    fn upload(&mut self) -> Option<&mut Upload> {
        None
    }
}

/// An uploaded file attached to a command.
///
/// Starts out holding an open byte stream. The file-lifecycle middleware
/// consumes the stream, stores the bytes, and records the result so the use
/// case can read [`Upload::stored`].
pub struct Upload {
    source: Option<ByteStream>,
    extension: Option<String>,
    stored: Option<SavedContent>,
}

impl Upload {
    pub fn new(source: impl AsyncRead + Send + Unpin + 'static, extension: Option<&str>) -> Self {
        Self {
            source: Some(Box::new(source)),
            extension: extension.map(str::to_string),
            stored: None,
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>, extension: Option<&str>) -> Self {
        Self::new(Cursor::new(bytes.into()), extension)
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// `true` while the stream has not been stored yet.
    pub fn is_pending(&self) -> bool {
        self.source.is_some()
    }

    pub fn stored(&self) -> Option<&SavedContent> {
        self.stored.as_ref()
    }

    /// Public URL of the stored file.
    pub fn url(&self) -> Option<&str> {
        self.stored.as_ref().map(|saved| saved.url.as_str())
    }

    pub(crate) fn take_source(&mut self) -> Option<ByteStream> {
        self.source.take()
    }

    pub(crate) fn set_stored(&mut self, saved: SavedContent) {
        self.stored = Some(saved);
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("pending", &self.is_pending())
            .field("extension", &self.extension)
            .field("stored", &self.stored)
            .finish()
    }
}
