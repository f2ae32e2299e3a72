//! Content keys: SHA-256 digests in lowercase hex.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const KEY_LEN: usize = 64;

const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentKeyError {
    #[error("content key must be {KEY_LEN} hex chars, got {0} chars")]
    Length(usize),
    #[error("content key contains non-hex characters")]
    NotHex,
}

/// Identifier of a stored blob: the SHA-256 digest of its bytes.
///
/// Always 64 lowercase hex characters; the inner string cannot be changed
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentKey(String);

impl ContentKey {
    /// Parse a key, accepting uppercase hex and normalizing it.
    pub fn parse(value: &str) -> Result<Self, ContentKeyError> {
        if value.len() != KEY_LEN {
            return Err(ContentKeyError::Length(value.len()));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ContentKeyError::NotHex);
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Key of an in-memory byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(bytes))
    }

    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Recover a key from a public URL or path such as
    /// `https://cdn/ab/cd/abcd….jpg`.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let file_name = path.rsplit('/').next()?;
        let stem = file_name.split_once('.').map_or(file_name, |(stem, _)| stem);
        Self::parse(stem).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative path `aa/bb/<key>[.ext]`.
    pub fn relative_path(&self, extension: Option<&str>) -> PathBuf {
        let mut path = PathBuf::from(&self.0[0..2]);
        path.push(&self.0[2..4]);
        path.push(file_name(self, extension));
        path
    }

    /// URL path segment `aa/bb/<key>[.ext]`, always `/`-separated.
    pub fn url_path(&self, extension: Option<&str>) -> String {
        format!(
            "{}/{}/{}",
            &self.0[0..2],
            &self.0[2..4],
            file_name(self, extension)
        )
    }
}

fn file_name(key: &ContentKey, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{}.{ext}", key.0),
        None => key.0.clone(),
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentKey {
    type Error = ContentKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        key.0
    }
}

/// Normalize a file extension: strip a leading dot, lowercase, and require
/// 1–16 ASCII alphanumerics. Empty input means "no extension".
pub fn normalize_extension(extension: Option<&str>) -> Result<Option<String>, String> {
    let Some(raw) = extension else {
        return Ok(None);
    };
    let ext = raw.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() {
        return Ok(None);
    }
    if ext.len() > MAX_EXTENSION_LEN || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(raw.to_string());
    }
    Ok(Some(ext))
}

/// Build the referenced-key set from persisted content URLs, skipping
/// values that do not point at stored content.
pub fn keys_from_urls<I, S>(urls: I) -> HashSet<ContentKey>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    urls.into_iter()
        .filter_map(|url| ContentKey::from_url(url.as_ref()))
        .collect()
}
