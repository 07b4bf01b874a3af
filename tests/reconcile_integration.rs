//! End-to-end reconciler tests against in-memory source and destination
//! fakes. These exercise the pass state machine: minimal-diff behavior,
//! idempotence across passes, symmetric naming at upload and delete time,
//! and partial-failure semantics.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use spacesync::error::{SyncError, SyncResult};
use spacesync::extract::ImageDescriber;
use spacesync::gateway::{CollectionHandle, DestinationGateway, DocumentRef, RetrievedChunk};
use spacesync::models::{EntityKind, EntityRecord, Snapshot};
use spacesync::reconcile::{Reconciler, SyncOptions};
use spacesync::source::SourceClient;
use spacesync::state::JsonStateStore;

// ============ Fakes ============

#[derive(Default)]
struct FakeSource {
    pages: Vec<EntityRecord>,
    bodies: HashMap<String, String>,
    attachments: HashMap<String, Vec<EntityRecord>>,
    files: HashMap<String, Vec<u8>>,
    fail_listing: bool,
}

impl FakeSource {
    fn with_page(mut self, id: &str, title: &str, version: &str, body: &str) -> Self {
        self.pages.push(EntityRecord::new(id, title, version));
        self.bodies.insert(id.to_string(), body.to_string());
        self
    }

    fn with_attachment(mut self, page_id: &str, id: &str, title: &str, version: &str) -> Self {
        self.attachments
            .entry(page_id.to_string())
            .or_default()
            .push(EntityRecord::new(id, title, version).with_parent(page_id));
        self.files.insert(id.to_string(), b"binary-bytes".to_vec());
        self
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn verify_credentials(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn list_pages(&self, _space_key: &str) -> SyncResult<Snapshot> {
        if self.fail_listing {
            return Err(SyncError::source_unavailable("HTTP 503"));
        }
        Ok(self.pages.clone())
    }

    async fn fetch_page_body(&self, page_id: &str) -> SyncResult<String> {
        Ok(self.bodies.get(page_id).cloned().unwrap_or_default())
    }

    async fn list_attachments(&self, page_id: &str) -> SyncResult<Snapshot> {
        Ok(self.attachments.get(page_id).cloned().unwrap_or_default())
    }

    async fn download_attachment(
        &self,
        _page_id: &str,
        record: &EntityRecord,
    ) -> SyncResult<Vec<u8>> {
        self.files
            .get(&record.id)
            .cloned()
            .ok_or_else(|| SyncError::source_unavailable("missing file"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    UpsertText(String),
    UpsertFile(String),
    Delete(String),
}

#[derive(Default)]
struct FakeGateway {
    collection_exists: bool,
    fail_names: HashSet<String>,
    ops: Mutex<Vec<Op>>,
    documents: Mutex<HashSet<String>>,
}

impl FakeGateway {
    fn existing() -> Self {
        Self {
            collection_exists: true,
            ..Default::default()
        }
    }

    fn failing(names: &[&str]) -> Self {
        Self {
            collection_exists: true,
            fail_names: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn upserted_names(&self) -> HashSet<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::UpsertText(name) | Op::UpsertFile(name) => Some(name),
                Op::Delete(_) => None,
            })
            .collect()
    }

    fn deleted_names(&self) -> HashSet<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Delete(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl DestinationGateway for FakeGateway {
    async fn get_or_create_collection(&self, _name: &str) -> SyncResult<CollectionHandle> {
        Ok(CollectionHandle {
            id: "c1".to_string(),
            created: !self.collection_exists,
        })
    }

    async fn list_documents(&self, _collection_id: &str) -> SyncResult<Vec<DocumentRef>> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .map(|name| DocumentRef {
                id: format!("doc-{name}"),
                name: name.clone(),
            })
            .collect())
    }

    async fn upsert_text_document(
        &self,
        _collection_id: &str,
        name: &str,
        _text: &str,
    ) -> SyncResult<()> {
        if self.fail_names.contains(name) {
            return Err(SyncError::destination_unavailable("HTTP 503 after retries"));
        }
        self.ops
            .lock()
            .unwrap()
            .push(Op::UpsertText(name.to_string()));
        self.documents.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn upsert_file_document(
        &self,
        _collection_id: &str,
        name: &str,
        _bytes: &[u8],
    ) -> SyncResult<()> {
        if self.fail_names.contains(name) {
            return Err(SyncError::destination_unavailable("HTTP 503 after retries"));
        }
        self.ops
            .lock()
            .unwrap()
            .push(Op::UpsertFile(name.to_string()));
        self.documents.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn delete_document_by_name(&self, _collection_id: &str, name: &str) -> SyncResult<()> {
        self.ops.lock().unwrap().push(Op::Delete(name.to_string()));
        self.documents.lock().unwrap().remove(name);
        Ok(())
    }

    async fn retrieve(
        &self,
        _collection_id: &str,
        _query: &str,
        _top_k: usize,
    ) -> SyncResult<Vec<RetrievedChunk>> {
        Ok(Vec::new())
    }
}

struct FakeDescriber;

#[async_trait]
impl ImageDescriber for FakeDescriber {
    async fn describe(&self, filename: &str, _bytes: &[u8]) -> SyncResult<String> {
        Ok(format!("Image Name: {filename}\nImage Description:\na chart"))
    }
}

fn reconciler(
    source: FakeSource,
    gateway: Arc<FakeGateway>,
    state_dir: &TempDir,
) -> Reconciler {
    Reconciler::new(
        Arc::new(source),
        gateway,
        JsonStateStore::new(state_dir.path()),
        2,
    )
    .with_image_describer(Arc::new(FakeDescriber))
}

// ============ Tests ============

#[tokio::test]
async fn first_pass_uploads_everything() {
    let state_dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::default());
    let source = FakeSource::default()
        .with_page("1", "Home", "v1", "<p>welcome</p>")
        .with_page("2", "Guide", "v1", "<p>how-to</p>")
        .with_attachment("1", "a1", "manual.pdf", "v1");

    let r = reconciler(source, Arc::clone(&gateway), &state_dir);
    let report = r
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.pages_upserted, 2);
    assert_eq!(report.attachments_upserted, 1);
    assert!(report.failed.is_empty());
    assert_eq!(
        gateway.upserted_names(),
        ["Home", "Guide", "manual.pdf"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    );
}

#[tokio::test]
async fn unchanged_source_means_zero_writes_on_second_pass() {
    let state_dir = TempDir::new().unwrap();
    let build_source = || {
        FakeSource::default()
            .with_page("1", "Home", "v1", "<p>welcome</p>")
            .with_attachment("1", "a1", "manual.pdf", "v1")
    };

    let first = Arc::new(FakeGateway::default());
    reconciler(build_source(), Arc::clone(&first), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();
    assert!(!first.ops().is_empty());

    let second = Arc::new(FakeGateway::existing());
    let report = reconciler(build_source(), Arc::clone(&second), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();

    assert!(second.ops().is_empty());
    assert_eq!(report.total_writes(), 0);
}

#[tokio::test]
async fn version_change_issues_exactly_one_upsert_and_no_deletes() {
    let state_dir = TempDir::new().unwrap();

    let first = Arc::new(FakeGateway::default());
    reconciler(
        FakeSource::default().with_page("1", "A", "v1", "<p>one</p>"),
        Arc::clone(&first),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();

    let second = Arc::new(FakeGateway::existing());
    reconciler(
        FakeSource::default().with_page("1", "A", "v2", "<p>two</p>"),
        Arc::clone(&second),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();

    assert_eq!(second.ops(), vec![Op::UpsertText("A".to_string())]);
}

#[tokio::test]
async fn removed_page_is_deleted_by_title() {
    let state_dir = TempDir::new().unwrap();

    let first = Arc::new(FakeGateway::default());
    reconciler(
        FakeSource::default()
            .with_page("1", "Keep", "v1", "<p>a</p>")
            .with_page("2", "Drop", "v1", "<p>b</p>"),
        Arc::clone(&first),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();

    let second = Arc::new(FakeGateway::existing());
    let report = reconciler(
        FakeSource::default().with_page("1", "Keep", "v1", "<p>a</p>"),
        Arc::clone(&second),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();

    assert_eq!(report.pages_deleted, 1);
    assert_eq!(
        second.deleted_names(),
        ["Drop".to_string()].into_iter().collect()
    );
}

#[tokio::test]
async fn image_attachment_uploads_and_deletes_under_the_same_txt_name() {
    let state_dir = TempDir::new().unwrap();

    // upload: img.png is described and stored as img.txt
    let first = Arc::new(FakeGateway::default());
    reconciler(
        FakeSource::default()
            .with_page("1", "Home", "v1", "<p>a</p>")
            .with_attachment("1", "a9", "img.png", "t1"),
        Arc::clone(&first),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();
    assert!(first.upserted_names().contains("img.txt"));

    // removal: the delete must target the name the upload used
    let second = Arc::new(FakeGateway::existing());
    reconciler(
        FakeSource::default().with_page("1", "Home", "v1", "<p>a</p>"),
        Arc::clone(&second),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();

    assert_eq!(
        second.deleted_names(),
        ["img.txt".to_string()].into_iter().collect()
    );
}

#[tokio::test]
async fn one_failing_attachment_does_not_block_the_rest() {
    let state_dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::failing(&["bad.pdf"]));
    let source = FakeSource::default()
        .with_page("1", "Home", "v1", "<p>a</p>")
        .with_attachment("1", "a1", "bad.pdf", "v1")
        .with_attachment("1", "a2", "good.pdf", "v1")
        .with_attachment("1", "a3", "also-good.pdf", "v1");

    let report = reconciler(source, Arc::clone(&gateway), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.attachments_upserted, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "bad.pdf");
    assert_eq!(report.failed[0].kind, EntityKind::Attachment);
    assert!(gateway.upserted_names().contains("good.pdf"));
    assert!(gateway.upserted_names().contains("also-good.pdf"));
}

#[tokio::test]
async fn failed_entity_is_not_retried_while_its_version_is_unchanged() {
    // persisting reflects what was observed, so a failed upload only
    // recurs once the source entity changes again
    let state_dir = TempDir::new().unwrap();
    let build_source = || {
        FakeSource::default()
            .with_page("1", "Home", "v1", "<p>a</p>")
            .with_attachment("1", "a1", "flaky.pdf", "v1")
    };

    let first = Arc::new(FakeGateway::failing(&["flaky.pdf"]));
    let report = reconciler(build_source(), Arc::clone(&first), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.failed.len(), 1);

    let second = Arc::new(FakeGateway::existing());
    let report = reconciler(build_source(), Arc::clone(&second), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();
    assert!(second.ops().is_empty());
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn full_pass_reuploads_unchanged_content() {
    let state_dir = TempDir::new().unwrap();
    let build_source = || FakeSource::default().with_page("1", "Home", "v1", "<p>a</p>");

    let first = Arc::new(FakeGateway::default());
    reconciler(build_source(), Arc::clone(&first), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();

    let second = Arc::new(FakeGateway::existing());
    let report = reconciler(build_source(), Arc::clone(&second), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions { full: true })
        .await
        .unwrap();

    assert_eq!(report.pages_upserted, 1);
    assert_eq!(second.ops(), vec![Op::UpsertText("Home".to_string())]);
}

#[tokio::test]
async fn listing_failure_aborts_before_any_write() {
    let state_dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::existing());
    let source = FakeSource {
        fail_listing: true,
        ..Default::default()
    };

    let err = reconciler(source, Arc::clone(&gateway), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::SourceUnavailable(_)));
    assert!(gateway.ops().is_empty());
    // nothing was persisted either
    let state = JsonStateStore::new(state_dir.path())
        .load("acme_ENG")
        .unwrap();
    assert!(state.pages.is_empty());
}

#[tokio::test]
async fn duplicate_page_id_in_listing_aborts_the_pass() {
    let state_dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::existing());
    let source = FakeSource::default()
        .with_page("1", "Home", "v1", "<p>a</p>")
        .with_page("1", "Home again", "v2", "<p>b</p>");

    let err = reconciler(source, Arc::clone(&gateway), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::DuplicateEntity { .. }));
    assert!(gateway.ops().is_empty());
}

#[tokio::test]
async fn unsupported_attachment_is_skipped_not_failed() {
    let state_dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::existing());
    let source = FakeSource::default()
        .with_page("1", "Home", "v1", "<p>a</p>")
        .with_attachment("1", "a1", "LICENSE", "v1");

    let report = reconciler(source, Arc::clone(&gateway), &state_dir)
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.skipped, 1);
    assert!(report.failed.is_empty());
    assert_eq!(report.attachments_upserted, 0);
}

#[tokio::test]
async fn attachments_survive_page_recreation_under_a_new_id() {
    // a page removed and recreated with a new id keeps its attachments'
    // ids; attachment diffing is per collection, so the attachment is not
    // churned
    let state_dir = TempDir::new().unwrap();

    let first = Arc::new(FakeGateway::default());
    reconciler(
        FakeSource::default()
            .with_page("1", "Home", "v1", "<p>a</p>")
            .with_attachment("1", "a1", "manual.pdf", "v1"),
        Arc::clone(&first),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();

    let second = Arc::new(FakeGateway::existing());
    let report = reconciler(
        FakeSource::default()
            .with_page("2", "Home", "v1", "<p>a</p>")
            .with_attachment("2", "a1", "manual.pdf", "v1"),
        Arc::clone(&second),
        &state_dir,
    )
    .sync_space("ENG", "acme_ENG", &SyncOptions::default())
    .await
    .unwrap();

    // page churns (old id deleted, new id uploaded) but the attachment
    // version is unchanged at its stable id — no attachment writes
    assert_eq!(report.attachments_upserted, 0);
    assert_eq!(report.attachments_deleted, 0);
    assert!(second.upserted_names().contains("Home"));
}

#[tokio::test]
async fn dry_run_preview_reports_pending_work_without_writing() {
    let state_dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::existing());
    let source = FakeSource::default()
        .with_page("1", "Home", "v1", "<p>a</p>")
        .with_attachment("1", "a1", "manual.pdf", "v1");

    let r = reconciler(source, Arc::clone(&gateway), &state_dir);
    let (pages, attachments) = r
        .preview("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(pages.upsert_count(), 1);
    assert_eq!(attachments.upsert_count(), 1);
    assert!(gateway.ops().is_empty());
}

#[tokio::test]
async fn cancellation_before_listing_has_no_side_effects() {
    let state_dir = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::existing());
    let source = FakeSource::default().with_page("1", "Home", "v1", "<p>a</p>");

    let r = reconciler(source, Arc::clone(&gateway), &state_dir);
    r.cancel_handle().store(true, std::sync::atomic::Ordering::Relaxed);

    let err = r
        .sync_space("ENG", "acme_ENG", &SyncOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert!(gateway.ops().is_empty());
    let state = JsonStateStore::new(state_dir.path())
        .load("acme_ENG")
        .unwrap();
    assert!(state.pages.is_empty());
}
