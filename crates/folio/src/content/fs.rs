//! Filesystem-backed content store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    normalize_extension, ByteStream, ContentKey, ContentStore, SavedContent, StoreError,
    StoredObject,
};
use crate::config::ContentStoreConfig;

/// Staging directory for in-progress uploads, directly under the root.
const TMP_DIR: &str = ".tmp";

const COPY_BUFFER: usize = 64 * 1024;

/// Content store rooted at a local directory.
///
/// Uploads are spooled into `{root}/.tmp` while being hashed, then published
/// with a hard link. The link fails if the target already exists, so the
/// first writer wins and readers never observe a partially written file.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
    base_url: String,
}

impl FsContentStore {
    /// The root directory does not need to exist yet.
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            root: root.into(),
            base_url,
        }
    }

    pub fn from_config(config: &ContentStoreConfig) -> Self {
        Self::new(config.root.clone(), config.base_url.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of one variant of a key.
    pub fn path_for(&self, key: &ContentKey, extension: Option<&str>) -> PathBuf {
        self.root.join(key.relative_path(extension))
    }

    async fn spool_and_publish(
        &self,
        source: ByteStream,
        tmp: &Path,
        extension: Option<&str>,
    ) -> Result<(ContentKey, u64, bool), StoreError> {
        let (key, size) = spool(source, tmp).await?;
        let target = self.path_for(&key, extension);

        if fs::try_exists(&target)
            .await
            .map_err(|e| StoreError::io(&target, e))?
        {
            return Ok((key, size, false));
        }

        let created = publish(tmp, &target).await?;
        Ok((key, size, created))
    }

    /// Remove empty shard directories from `dir` up to (not including) the root.
    async fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

/// Copy the stream into `tmp`, hashing as we go.
async fn spool(mut source: ByteStream, tmp: &Path) -> Result<(ContentKey, u64), StoreError> {
    let mut file = fs::File::create(tmp)
        .await
        .map_err(|e| StoreError::io(tmp, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;

    loop {
        let read = source
            .read(&mut buf)
            .await
            .map_err(|e| StoreError::io(tmp, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        file.write_all(&buf[..read])
            .await
            .map_err(|e| StoreError::io(tmp, e))?;
        size += read as u64;
    }

    file.sync_all().await.map_err(|e| StoreError::io(tmp, e))?;
    Ok((ContentKey::from_hasher(hasher), size))
}

/// Link `tmp` into place. Returns `false` if another writer got there first.
async fn publish(tmp: &Path, target: &Path) -> Result<bool, StoreError> {
    let mut retried = false;
    loop {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        match fs::hard_link(tmp, target).await {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            // A concurrent delete can prune the shard directory between
            // create_dir_all and the link.
            Err(e) if e.kind() == ErrorKind::NotFound && !retried => retried = true,
            Err(e) => return Err(StoreError::io(target, e)),
        }
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn save(
        &self,
        source: ByteStream,
        extension: Option<&str>,
    ) -> Result<SavedContent, StoreError> {
        let extension = normalize_extension(extension).map_err(StoreError::InvalidExtension)?;

        let tmp_dir = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| StoreError::io(&tmp_dir, e))?;
        let tmp = tmp_dir.join(format!("{}.part", Uuid::new_v4()));

        let result = self
            .spool_and_publish(source, &tmp, extension.as_deref())
            .await;

        if let Err(err) = fs::remove_file(&tmp).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %err, "failed to remove upload staging file");
            }
        }

        let (key, size, created) = result?;
        debug!(key = %key, size, created, "stored content");

        Ok(SavedContent {
            url: self.url(&key, extension.as_deref()),
            key,
            extension,
            size,
            created,
        })
    }

    async fn exists(&self, key: &ContentKey, extension: Option<&str>) -> Result<bool, StoreError> {
        let extension = normalize_extension(extension).map_err(StoreError::InvalidExtension)?;
        let path = self.path_for(key, extension.as_deref());
        fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }

    fn url(&self, key: &ContentKey, extension: Option<&str>) -> String {
        format!("{}/{}", self.base_url, key.url_path(extension))
    }

    async fn delete(&self, key: &ContentKey, extension: Option<&str>) -> Result<(), StoreError> {
        let extension = normalize_extension(extension).map_err(StoreError::InvalidExtension)?;
        let path = self.path_for(key, extension.as_deref());

        match fs::remove_file(&path).await {
            Ok(()) => debug!(key = %key, path = %path.display(), "deleted content"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        self.prune_empty_dirs(path.parent()).await;
        Ok(())
    }

    fn list_all_keys(&self) -> BoxStream<'_, Result<StoredObject, StoreError>> {
        let walk = Walk {
            pending: vec![self.root.clone()],
            current: None,
        };
        stream::unfold(walk, |mut walk| async move {
            let item = walk.next_object().await?;
            Some((item, walk))
        })
        .boxed()
    }
}

/// Depth-first directory walk holding one open directory at a time.
struct Walk {
    pending: Vec<PathBuf>,
    current: Option<(PathBuf, fs::ReadDir)>,
}

impl Walk {
    async fn next_object(&mut self) -> Option<Result<StoredObject, StoreError>> {
        loop {
            if self.current.is_none() {
                let dir = self.pending.pop()?;
                match fs::read_dir(&dir).await {
                    Ok(entries) => self.current = Some((dir, entries)),
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Some(Err(StoreError::io(dir, e))),
                }
            }

            let Some((dir, entries)) = self.current.as_mut() else {
                continue;
            };
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(e) => {
                    let dir = dir.clone();
                    self.current = None;
                    return Some(Err(StoreError::io(dir, e)));
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(e) => return Some(Err(StoreError::io(path, e))),
            };
            if file_type.is_dir() {
                if entry.file_name() != TMP_DIR {
                    self.pending.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let Some(key_and_extension) = parse_file_name(&entry.file_name().to_string_lossy())
            else {
                continue;
            };
            let (key, extension) = key_and_extension;

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Deleted between listing and stat.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Some(Err(StoreError::io(path, e))),
            };
            let modified = match metadata.modified() {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(e) => return Some(Err(StoreError::io(path, e))),
            };

            return Some(Ok(StoredObject {
                key,
                extension,
                modified,
                size: metadata.len(),
            }));
        }
    }
}

/// `<64 lowercase hex>[.ext]` → key and extension; anything else is skipped.
///
/// Only names `save` could have produced are accepted, so `path_for` of the
/// result is the listed file. `<key>.JPG` or `<key>.tar.gz` are foreign.
fn parse_file_name(name: &str) -> Option<(ContentKey, Option<String>)> {
    let (stem, extension) = match name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let key = ContentKey::parse(stem).ok()?;
    if key.as_str() != stem {
        return None;
    }
    match extension {
        None => Some((key, None)),
        Some(ext) => match normalize_extension(Some(ext)) {
            Ok(Some(normalized)) if normalized == ext => Some((key, Some(normalized))),
            _ => None,
        },
    }
}
