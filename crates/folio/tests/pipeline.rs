//! End-to-end behaviour of the full middleware stack:
//! idempotency → file lifecycle → transaction → use case.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use folio_core::content::ContentKey;
use folio_core::{
    async_trait, idempotency_key_field, upload_field, CacheStatus, Command, Context, ContentStore,
    DomainError, FileLifecycleMiddleware, IdempotencyConfig, IdempotencyCoordinator,
    IdempotencyMiddleware, LocalLock, MemoryIdempotencyStore, Pipeline, PipelineError, Response,
    TransactionMiddleware, Upload, UseCase, IDEMPOTENCY_CACHE_HEADER,
};
use folio_outbox::{EventSink, TransactionalEventPublisher};
use folio_testing::{
    temp_content_store, FailingSink, ManualClock, MemoryTransaction, MemoryTransactionManager,
    RecordingSink, TempContentStore,
};
use serde_json::json;

#[derive(Debug, Clone, PartialEq)]
enum BookEvent {
    Created(String),
}

struct CreateBook {
    key: Option<String>,
    title: String,
    cover: Option<Upload>,
}

impl Command for CreateBook {
    idempotency_key_field!(optional key);
    upload_field!(cover);
}

fn create(key: &str, title: &str) -> CreateBook {
    CreateBook {
        key: Some(key.to_string()),
        title: title.to_string(),
        cover: None,
    }
}

fn create_with_cover(key: &str, title: &str, cover: &[u8]) -> CreateBook {
    CreateBook {
        cover: Some(Upload::from_bytes(cover.to_vec(), Some("jpg"))),
        ..create(key, title)
    }
}

struct CreateBookUseCase {
    publisher: TransactionalEventPublisher<BookEvent>,
    calls: AtomicUsize,
}

impl CreateBookUseCase {
    fn new(sink: Arc<dyn EventSink<BookEvent>>) -> Self {
        Self {
            publisher: TransactionalEventPublisher::new(sink),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UseCase<CreateBook> for CreateBookUseCase {
    async fn execute(&self, cmd: CreateBook, ctx: &mut Context) -> anyhow::Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cmd.title == "panic" {
            panic!("use case blew up");
        }
        if cmd.title.trim().is_empty() {
            return Err(DomainError::field("title", "title.blank", "title is required").into());
        }

        ctx.transaction()?
            .downcast_mut::<MemoryTransaction>()
            .context("expected an in-memory transaction")?
            .insert(cmd.title.clone());
        self.publisher
            .publish_in(ctx, BookEvent::Created(cmd.title.clone()))?;

        let cover = cmd.cover.as_ref().and_then(Upload::url);
        Ok(Response::created(&json!({
            "title": cmd.title,
            "cover": cover,
        })))
    }
}

struct Harness {
    pipeline: Pipeline<CreateBook>,
    coordinator: IdempotencyCoordinator,
    lock: Arc<LocalLock>,
    transactions: Arc<MemoryTransactionManager>,
    content: TempContentStore,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(IdempotencyConfig::default())
    }

    fn with_config(config: IdempotencyConfig) -> Self {
        let clock = ManualClock::starting_now();
        let lock = Arc::new(LocalLock::new());
        let coordinator =
            IdempotencyCoordinator::new(Arc::new(MemoryIdempotencyStore::new()), lock.clone())
                .with_clock(clock.clone());
        let transactions = MemoryTransactionManager::new();
        let content = temp_content_store().unwrap();

        let pipeline = Pipeline::new()
            .pipe(IdempotencyMiddleware::new(coordinator.clone(), config))
            .pipe(FileLifecycleMiddleware::new(content.store.clone()))
            .pipe(TransactionMiddleware::new(transactions.clone()));

        Self {
            pipeline,
            coordinator,
            lock,
            transactions,
            content,
            clock,
        }
    }
}

#[tokio::test]
async fn replays_first_response_for_same_key() {
    let harness = Harness::new();
    let sink = RecordingSink::<BookEvent>::new();
    let use_case = CreateBookUseCase::new(sink.clone());

    let first = harness
        .pipeline
        .execute(create("K1", "First"), &use_case)
        .await
        .unwrap();
    let second = harness
        .pipeline
        .execute(create("K1", "Second"), &use_case)
        .await
        .unwrap();

    assert_eq!(first.cache, CacheStatus::Miss);
    assert_eq!(second.cache, CacheStatus::Hit);
    assert_eq!(IDEMPOTENCY_CACHE_HEADER, "X-Idempotency-Cache");
    assert_eq!(second.cache.as_header_value(), "HIT");
    assert_eq!(second.status, 201);
    assert_eq!(second.payload(), first.payload());
    assert_eq!(second.payload().unwrap()["title"], "First");

    assert_eq!(use_case.calls(), 1);
    assert_eq!(harness.transactions.rows(), vec!["First".to_string()]);
    assert_eq!(sink.events(), vec![BookEvent::Created("First".into())]);
}

#[tokio::test]
async fn commands_without_a_key_always_execute() {
    let harness = Harness::new();
    let use_case = CreateBookUseCase::new(RecordingSink::<BookEvent>::new());

    for title in ["One", "Two"] {
        let command = CreateBook {
            key: None,
            ..create("", title)
        };
        let response = harness.pipeline.execute(command, &use_case).await.unwrap();
        assert_eq!(response.cache, CacheStatus::Miss);
    }

    assert_eq!(use_case.calls(), 2);
}

#[tokio::test]
async fn blank_key_is_a_validation_error() {
    let harness = Harness::new();
    let use_case = CreateBookUseCase::new(RecordingSink::<BookEvent>::new());

    let err = harness
        .pipeline
        .execute(create("  ", "First"), &use_case)
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some("idempotency_key.blank"));
    assert_eq!(err.status_code(), 422);
    assert_eq!(use_case.calls(), 0);
}

#[tokio::test]
async fn cached_response_lasts_until_expiry() {
    let harness =
        Harness::with_config(IdempotencyConfig::default().with_record_ttl(Duration::from_secs(60)));
    let use_case = CreateBookUseCase::new(RecordingSink::<BookEvent>::new());
    harness
        .pipeline
        .execute(create("K1", "First"), &use_case)
        .await
        .unwrap();

    harness.clock.advance(chrono::Duration::seconds(60));
    let at_expiry = harness
        .pipeline
        .execute(create("K1", "Second"), &use_case)
        .await
        .unwrap();
    assert!(at_expiry.is_hit());

    harness.clock.advance(chrono::Duration::seconds(1));
    let after_expiry = harness
        .pipeline
        .execute(create("K1", "Third"), &use_case)
        .await
        .unwrap();
    assert!(!after_expiry.is_hit());
    assert_eq!(after_expiry.payload().unwrap()["title"], "Third");
    assert_eq!(use_case.calls(), 2);
}

#[tokio::test]
async fn failed_use_case_removes_upload_and_allows_retry() {
    let harness = Harness::new();
    let sink = RecordingSink::<BookEvent>::new();
    let use_case = CreateBookUseCase::new(sink.clone());
    let key = ContentKey::of_bytes(b"cover bytes");

    let err = harness
        .pipeline
        .execute(create_with_cover("K1", "", b"cover bytes"), &use_case)
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some("title.blank"));
    assert!(!harness
        .content
        .store
        .exists(&key, Some("jpg"))
        .await
        .unwrap());
    assert!(harness.coordinator.get_record("K1").await.unwrap().is_none());
    assert_eq!(harness.transactions.rolled_back(), 1);
    assert!(sink.is_empty());

    let retry = harness
        .pipeline
        .execute(create_with_cover("K1", "Fixed", b"cover bytes"), &use_case)
        .await
        .unwrap();

    assert!(!retry.is_hit());
    assert_eq!(
        retry.payload().unwrap()["cover"],
        harness.content.store.url(&key, Some("jpg"))
    );
    assert!(harness
        .content
        .store
        .exists(&key, Some("jpg"))
        .await
        .unwrap());
}

#[tokio::test]
async fn delivery_failure_does_not_undo_the_write() {
    let harness = Harness::new();
    let sink = FailingSink::new();
    let use_case = CreateBookUseCase::new(sink.clone());

    let response = harness
        .pipeline
        .execute(create("K1", "First"), &use_case)
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(sink.attempts(), 1);
    assert_eq!(harness.transactions.rows(), vec!["First".to_string()]);
    assert!(harness
        .coordinator
        .get_record("K1")
        .await
        .unwrap()
        .is_some_and(|record| record.is_finished()));
}

#[tokio::test]
async fn commit_failure_is_an_infrastructure_error() {
    let harness = Harness::new();
    let sink = RecordingSink::<BookEvent>::new();
    let use_case = CreateBookUseCase::new(sink.clone());
    harness.transactions.fail_commits(true);

    let err = harness
        .pipeline
        .execute(create("K1", "First"), &use_case)
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 500);
    assert!(sink.is_empty());
    assert!(harness.transactions.rows().is_empty());
    assert!(harness.coordinator.get_record("K1").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_left_by_a_crashed_request_blocks_until_swept() {
    let harness = Harness::new();
    let use_case = CreateBookUseCase::new(RecordingSink::<BookEvent>::new());
    // A process that died after claiming the key never finishes or abandons it.
    assert!(harness
        .coordinator
        .start_request("K1", IdempotencyConfig::default().record_ttl())
        .await
        .unwrap());

    harness.clock.advance(chrono::Duration::hours(2));
    let err = harness
        .pipeline
        .execute(create("K1", "Retry"), &use_case)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Contention { ref key } if key == "K1"));
    assert_eq!(err.status_code(), 409);
    assert_eq!(use_case.calls(), 0);
    assert!(!harness.lock.is_held("idempotency:K1"));

    let swept = harness
        .coordinator
        .delete_expired(Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let retry = harness
        .pipeline
        .execute(create("K1", "Retry"), &use_case)
        .await
        .unwrap();
    assert_eq!(retry.cache, CacheStatus::Miss);
    assert_eq!(use_case.calls(), 1);
    assert_eq!(harness.transactions.rows(), vec!["Retry".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_and_claim_are_released_when_the_use_case_panics() {
    let harness = Arc::new(Harness::new());
    let use_case = Arc::new(CreateBookUseCase::new(RecordingSink::<BookEvent>::new()));

    let joined = {
        let harness = harness.clone();
        let use_case = use_case.clone();
        tokio::spawn(async move {
            harness
                .pipeline
                .execute(create("K1", "panic"), use_case.as_ref())
                .await
        })
        .await
    };
    assert!(joined.unwrap_err().is_panic());
    assert!(!harness.lock.is_held("idempotency:K1"));

    let retry = harness
        .pipeline
        .execute(create("K1", "After"), use_case.as_ref())
        .await
        .unwrap();
    assert!(!retry.is_hit());
    assert_eq!(use_case.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_create_one_row() {
    let harness = Arc::new(Harness::new());
    let use_case = Arc::new(CreateBookUseCase::new(RecordingSink::<BookEvent>::new()));

    let tasks: Vec<_> = ["First", "Second"]
        .into_iter()
        .map(|title| {
            let harness = harness.clone();
            let use_case = use_case.clone();
            tokio::spawn(async move {
                harness
                    .pipeline
                    .execute(create("K1", title), use_case.as_ref())
                    .await
            })
        })
        .collect();

    let mut responses = Vec::new();
    for task in tasks {
        responses.push(task.await.unwrap().unwrap());
    }

    assert_eq!(harness.transactions.rows().len(), 1);
    assert_eq!(use_case.calls(), 1);
    assert_eq!(responses[0].payload(), responses[1].payload());
}
