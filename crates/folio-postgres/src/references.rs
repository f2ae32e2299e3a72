use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use folio_core::content::{keys_from_urls, ContentKey, ReferenceSource};
use sqlx::PgPool;
use tracing::debug;

/// Content keys referenced by catalog rows, read with a single query.
///
/// The query must return one text column of content URLs, for example:
///
/// ```sql
/// SELECT cover_url FROM books WHERE cover_url IS NOT NULL
/// UNION
/// SELECT file_url FROM attachments
/// ```
///
/// NULLs and URLs that do not point at stored content are ignored.
#[derive(Clone)]
pub struct PgReferenceSource {
    pool: PgPool,
    query: String,
}

impl PgReferenceSource {
    pub fn new(pool: PgPool, query: impl Into<String>) -> Self {
        Self {
            pool,
            query: query.into(),
        }
    }
}

#[async_trait]
impl ReferenceSource for PgReferenceSource {
    async fn referenced_keys(&self) -> Result<HashSet<ContentKey>> {
        let urls: Vec<Option<String>> = sqlx::query_scalar(&self.query)
            .fetch_all(&self.pool)
            .await?;
        let rows = urls.len();
        let keys = keys_from_urls(urls.into_iter().flatten());
        debug!(rows, keys = keys.len(), "loaded referenced content keys");
        Ok(keys)
    }
}
