use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::ContentStore;
use crate::command::Command;
use crate::pipeline::{Context, Middleware, Next};
use crate::response::Response;

/// Stores a command's upload before the use case runs and removes it again
/// if the use case fails.
///
/// Only a file this request created is removed. If identical bytes were
/// already stored, another record may own them and the file is left alone.
pub struct FileLifecycleMiddleware {
    store: Arc<dyn ContentStore>,
}

impl FileLifecycleMiddleware {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for FileLifecycleMiddleware {
    async fn handle(
        &self,
        mut command: C,
        ctx: &mut Context,
        next: Next<'_, C>,
    ) -> anyhow::Result<Response> {
        let mut saved = None;
        if let Some(upload) = command.upload() {
            if let Some(source) = upload.take_source() {
                let stored = self.store.save(source, upload.extension()).await?;
                debug!(key = %stored.key, created = stored.created, "upload stored");
                saved = Some(stored.clone());
                upload.set_stored(stored);
            }
        }

        let result = next.run(command, ctx).await;

        if let (Err(_), Some(saved)) = (&result, saved) {
            if saved.created {
                match self
                    .store
                    .delete(&saved.key, saved.extension.as_deref())
                    .await
                {
                    Ok(()) => debug!(key = %saved.key, "removed upload of failed command"),
                    Err(error) => {
                        warn!(key = %saved.key, %error, "failed to remove upload of failed command")
                    }
                }
            }
        }
        result
    }
}
