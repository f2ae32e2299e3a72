//! Transactional event publication.
//!
//! Domain events raised inside a use case must not escape if the transaction
//! rolls back. [`TransactionalEventPublisher`] never publishes directly: it
//! registers an after-commit callback on the [`TransactionHandle`], so events
//! reach the [`EventSink`] only once the write is durable, in the order they
//! were raised, before `commit` returns.
//!
//! ## Guarantees
//!
//! - **No leakage**: rollback discards every registered event
//! - **Ordered**: events from one transaction are delivered in registration order
//! - **Best effort after commit**: a failed delivery is reported to the
//!   committer but cannot undo the commit
//!
//! For delivery that survives a crash between commit and publish, write the
//! event to a table inside the transaction and relay it from there.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use folio_core::{Context, TransactionHandle};
use tokio::sync::broadcast;
use tracing::debug;

/// Destination for committed events (message bus, webhook relay, ...).
#[async_trait]
pub trait EventSink<E>: Send + Sync {
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

#[async_trait]
impl<E, S> EventSink<E> for Arc<S>
where
    E: Send + 'static,
    S: EventSink<E> + ?Sized,
{
    async fn publish(&self, event: E) -> anyhow::Result<()> {
        (**self).publish(event).await
    }
}

/// Defers events until their transaction commits.
pub struct TransactionalEventPublisher<E> {
    sink: Arc<dyn EventSink<E>>,
    _event: PhantomData<fn(E)>,
}

impl<E> Clone for TransactionalEventPublisher<E> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            _event: PhantomData,
        }
    }
}

impl<E: Send + 'static> TransactionalEventPublisher<E> {
    pub fn new(sink: Arc<dyn EventSink<E>>) -> Self {
        Self {
            sink,
            _event: PhantomData,
        }
    }

    /// Queue `event` for delivery after `tx` commits. Nothing is sent now.
    pub fn publish_after_commit(&self, tx: &mut TransactionHandle, event: E) {
        let sink = self.sink.clone();
        tx.after_commit(move || async move { sink.publish(event).await });
        debug!(pending = tx.pending_callbacks(), "event queued for after commit");
    }

    /// Like [`publish_after_commit`](Self::publish_after_commit), using the
    /// transaction attached to the pipeline context.
    pub fn publish_in(&self, ctx: &mut Context, event: E) -> anyhow::Result<()> {
        let tx = ctx.transaction()?;
        self.publish_after_commit(tx, event);
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
///
/// At-most-once: slow receivers may lag and miss events, and events sent
/// while nobody is subscribed are dropped.
pub struct BroadcastSink<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> BroadcastSink<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl<E: Clone + Send + 'static> EventSink<E> for BroadcastSink<E> {
    async fn publish(&self, event: E) -> anyhow::Result<()> {
        if let Ok(receivers) = self.sender.send(event) {
            debug!(receivers, "event broadcast");
        } else {
            debug!("event broadcast with no subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{CommitError, Transaction};
    use std::any::Any;
    use std::sync::Mutex;

    struct NoopTransaction;

    #[async_trait]
    impl Transaction for NoopTransaction {
        async fn commit(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        reject: Option<&'static str>,
    }

    #[async_trait]
    impl EventSink<&'static str> for Recorder {
        async fn publish(&self, event: &'static str) -> anyhow::Result<()> {
            if self.reject == Some(event) {
                anyhow::bail!("sink rejected {event}");
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn handle() -> TransactionHandle {
        TransactionHandle::new(Box::new(NoopTransaction))
    }

    #[tokio::test]
    async fn events_wait_for_commit_and_keep_order() {
        let sink = Arc::new(Recorder::default());
        let publisher: TransactionalEventPublisher<&'static str> =
            TransactionalEventPublisher::new(sink.clone());
        let mut tx = handle();

        publisher.publish_after_commit(&mut tx, "book.created");
        publisher.publish_after_commit(&mut tx, "book.published");
        assert!(sink.events.lock().unwrap().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(
            *sink.events.lock().unwrap(),
            vec!["book.created", "book.published"]
        );
    }

    #[tokio::test]
    async fn rollback_discards_events() {
        let sink = Arc::new(Recorder::default());
        let publisher: TransactionalEventPublisher<&'static str> =
            TransactionalEventPublisher::new(sink.clone());
        let mut tx = handle();
        publisher.publish_after_commit(&mut tx, "book.created");

        tx.rollback().await.unwrap();

        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_is_reported_but_later_events_still_go_out() {
        let sink = Arc::new(Recorder {
            reject: Some("first"),
            ..Recorder::default()
        });
        let publisher: TransactionalEventPublisher<&'static str> =
            TransactionalEventPublisher::new(sink.clone());
        let mut tx = handle();
        publisher.publish_after_commit(&mut tx, "first");
        publisher.publish_after_commit(&mut tx, "second");

        let err = tx.commit().await.unwrap_err();

        assert!(err.is_committed());
        assert!(matches!(err, CommitError::AfterCommit { failed: 1, .. }));
        assert_eq!(*sink.events.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn publish_in_requires_a_transaction() {
        let publisher: TransactionalEventPublisher<&'static str> =
            TransactionalEventPublisher::new(Arc::new(Recorder::default()));
        let mut ctx = Context::new();

        assert!(publisher.publish_in(&mut ctx, "orphan").is_err());

        ctx.attach_transaction(handle());
        publisher.publish_in(&mut ctx, "book.created").unwrap();
        assert_eq!(ctx.transaction().unwrap().pending_callbacks(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers_and_tolerates_none() {
        let sink = BroadcastSink::<&'static str>::new(8);
        sink.publish("unheard").await.unwrap();

        let mut receiver = sink.subscribe();
        sink.publish("heard").await.unwrap();

        assert_eq!(receiver.recv().await.unwrap(), "heard");
    }
}
