//! Sync-pass orchestration.
//!
//! One pass runs Listing → Diffing → Applying → Persisting → Done. A
//! failure during Listing aborts before any destructive operation; once
//! Applying has begun, per-entity failures are recorded in the pass report
//! and the pass continues, so one broken attachment never blocks the rest
//! of a space. State is persisted exactly once, after all workers join,
//! and reflects what was *observed* — entities that were attempted keep
//! their observed version whether the write succeeded or not, while
//! entities never dispatched (cancellation) keep their previous version so
//! the next pass picks them up again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::diff::diff;
use crate::error::{SyncError, SyncResult};
use crate::extract::{classify, destination_name, extract_tabular_text, AttachmentClass, ImageDescriber};
use crate::gateway::DestinationGateway;
use crate::models::{
    CollectionState, DiffResult, EntityKind, EntityRecord, FailedEntity, Snapshot, SyncReport,
};
use crate::normalize::normalize;
use crate::source::SourceClient;
use crate::state::JsonStateStore;

/// Options for a single pass.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Ignore cached state and reconcile against an empty previous
    /// snapshot, re-uploading everything currently in the source.
    pub full: bool,
}

/// Drives one collection's sync passes.
pub struct Reconciler {
    source: Arc<dyn SourceClient>,
    gateway: Arc<dyn DestinationGateway>,
    state: JsonStateStore,
    image_describer: Option<Arc<dyn ImageDescriber>>,
    max_concurrency: usize,
    cancel: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceClient>,
        gateway: Arc<dyn DestinationGateway>,
        state: JsonStateStore,
        max_concurrency: usize,
    ) -> Self {
        Self {
            source,
            gateway,
            state,
            image_describer: None,
            max_concurrency: max_concurrency.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_image_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.image_describer = Some(describer);
        self
    }

    /// Handle that aborts the pass cooperatively: before Applying the pass
    /// stops with no side effects; during Applying, in-flight entities
    /// finish, nothing new is dispatched, and completed work is persisted.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// List and diff without applying anything. The destination is not
    /// contacted, so a collection that does not exist yet previews against
    /// whatever local state is cached.
    pub async fn preview(
        &self,
        space_key: &str,
        collection: &str,
        options: &SyncOptions,
    ) -> SyncResult<(DiffResult, DiffResult)> {
        let (pages, attachments) = self.capture(space_key).await?;
        let previous = if options.full {
            CollectionState::empty(collection)
        } else {
            self.state.load(collection)?
        };

        let page_diff = diff(EntityKind::Page, &previous.pages, &pages)?;
        let attachment_diff = diff(EntityKind::Attachment, &previous.attachments, &attachments)?;
        Ok((page_diff, attachment_diff))
    }

    /// Run one sync pass for a space against the named destination
    /// collection.
    pub async fn sync_space(
        &self,
        space_key: &str,
        collection: &str,
        options: &SyncOptions,
    ) -> SyncResult<SyncReport> {
        info!(space = space_key, collection, "sync pass starting");

        if self.cancelled() {
            return Err(SyncError::Cancelled);
        }

        // --- Listing: resolve the destination, capture snapshots ---
        let handle = self.gateway.get_or_create_collection(collection).await?;
        if handle.created {
            info!(collection, "created destination collection, resetting cached state");
            self.state.reset(collection)?;
        }

        let (pages, attachments) = self.capture(space_key).await?;

        // --- Diffing ---
        let previous = if options.full {
            CollectionState::empty(collection)
        } else {
            self.state.load(collection)?
        };
        let page_diff = diff(EntityKind::Page, &previous.pages, &pages)?;
        let attachment_diff = diff(EntityKind::Attachment, &previous.attachments, &attachments)?;

        info!(
            pages_added = page_diff.added.len(),
            pages_updated = page_diff.updated.len(),
            pages_removed = page_diff.removed.len(),
            attachments_added = attachment_diff.added.len(),
            attachments_updated = attachment_diff.updated.len(),
            attachments_removed = attachment_diff.removed.len(),
            "diff computed"
        );

        if self.cancelled() {
            return Err(SyncError::Cancelled);
        }

        // --- Applying ---
        // Removals run before upserts within each entity class: when a
        // name is released by one entity and claimed by another in the
        // same pass (page recreated under a new id, attachment replaced by
        // a like-named sibling), deleting first lets the new document
        // supersede the old one instead of being destroyed by it.
        let mut report = SyncReport::new(collection);

        let mut attempted_page_removals: HashSet<String> = HashSet::new();
        for record in &page_diff.removed {
            if self.cancelled() {
                break;
            }
            attempted_page_removals.insert(record.id.clone());
            match self
                .gateway
                .delete_document_by_name(&handle.id, &record.title)
                .await
            {
                Ok(()) => {
                    info!(page = %record.title, "deleted page document");
                    report.pages_deleted += 1;
                    report.succeeded.push(record.title.clone());
                }
                Err(err) => self.record_failure(&mut report, EntityKind::Page, record, err),
            }
        }

        let mut attempted_pages: HashSet<String> = HashSet::new();
        for record in page_diff.added.iter().chain(page_diff.updated.iter()) {
            if self.cancelled() {
                break;
            }
            attempted_pages.insert(record.id.clone());
            match self.apply_page(&handle.id, record).await {
                Ok(()) => {
                    report.pages_upserted += 1;
                    report.succeeded.push(record.title.clone());
                }
                Err(err) => self.record_failure(&mut report, EntityKind::Page, record, err),
            }
        }

        let mut attempted_attachment_removals: HashSet<String> = HashSet::new();
        for record in &attachment_diff.removed {
            if self.cancelled() {
                break;
            }
            attempted_attachment_removals.insert(record.id.clone());
            let name = destination_name(&record.title);
            match self.gateway.delete_document_by_name(&handle.id, &name).await {
                Ok(()) => {
                    info!(attachment = %record.title, document = %name, "deleted attachment document");
                    report.attachments_deleted += 1;
                    report.succeeded.push(name);
                }
                Err(err) => self.record_failure(&mut report, EntityKind::Attachment, record, err),
            }
        }

        let attachment_work: Vec<EntityRecord> = attachment_diff
            .added
            .iter()
            .chain(attachment_diff.updated.iter())
            .cloned()
            .collect();
        let attempted_attachments = self
            .apply_attachments(&handle.id, attachment_work, &mut report)
            .await;

        report.cancelled = self.cancelled();

        // --- Persisting ---
        let new_state = CollectionState {
            collection: collection.to_string(),
            saved_at: Some(chrono::Utc::now()),
            pages: persisted_snapshot(
                &previous.pages,
                &pages,
                &page_diff,
                &attempted_pages,
                &attempted_page_removals,
            ),
            attachments: persisted_snapshot(
                &previous.attachments,
                &attachments,
                &attachment_diff,
                &attempted_attachments,
                &attempted_attachment_removals,
            ),
        };
        self.state.save(collection, &new_state)?;

        info!(
            upserted = report.pages_upserted + report.attachments_upserted,
            deleted = report.pages_deleted + report.attachments_deleted,
            failed = report.failed.len(),
            skipped = report.skipped,
            "sync pass done"
        );
        Ok(report)
    }

    /// Capture the current page and attachment snapshots. Attachments are
    /// listed per page and concatenated into one per-collection snapshot,
    /// so a page replaced under a new id cannot strand its attachments.
    async fn capture(&self, space_key: &str) -> SyncResult<(Snapshot, Snapshot)> {
        let pages = self.source.list_pages(space_key).await?;
        let mut attachments = Vec::new();
        for page in &pages {
            attachments.extend(self.source.list_attachments(&page.id).await?);
        }
        Ok((pages, attachments))
    }

    async fn apply_page(&self, collection_id: &str, record: &EntityRecord) -> SyncResult<()> {
        let raw = self.source.fetch_page_body(&record.id).await?;
        let text = normalize(&raw);
        self.gateway
            .upsert_text_document(collection_id, &record.title, &text)
            .await?;
        info!(page = %record.title, "upserted page document");
        Ok(())
    }

    /// Fan added/updated attachments out across a bounded worker pool.
    /// Returns the set of attachment ids that were actually dispatched.
    ///
    /// Snapshots are captured before fan-out and never touched by workers;
    /// two workers never hold the same destination name concurrently
    /// (name-keyed locks); the state store is written only after all
    /// workers have joined.
    async fn apply_attachments(
        &self,
        collection_id: &str,
        work: Vec<EntityRecord>,
        report: &mut SyncReport,
    ) -> HashSet<String> {
        let mut name_locks: HashMap<String, Arc<Mutex<()>>> = HashMap::new();
        for record in &work {
            name_locks
                .entry(destination_name(&record.title))
                .or_insert_with(|| Arc::new(Mutex::new(())));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks: JoinSet<AttachmentResult> = JoinSet::new();

        for record in work {
            if self.cancelled() {
                break;
            }
            let name = destination_name(&record.title);
            let lock = Arc::clone(&name_locks[&name]);
            let semaphore = Arc::clone(&semaphore);
            let cancel = Arc::clone(&self.cancel);
            let source = Arc::clone(&self.source);
            let gateway = Arc::clone(&self.gateway);
            let describer = self.image_describer.clone();
            let collection_id = collection_id.to_string();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                if cancel.load(Ordering::Relaxed) {
                    return AttachmentResult {
                        record,
                        outcome: ApplyOutcome::NotAttempted,
                    };
                }
                let _guard = lock.lock().await;
                let outcome =
                    apply_attachment(source, gateway, describer, &collection_id, &record).await;
                AttachmentResult { record, outcome }
            });
        }

        let mut attempted = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "attachment worker aborted");
                    continue;
                }
            };
            match result.outcome {
                ApplyOutcome::NotAttempted => {}
                ApplyOutcome::Uploaded(name) => {
                    attempted.insert(result.record.id.clone());
                    report.attachments_upserted += 1;
                    report.succeeded.push(name);
                }
                ApplyOutcome::Skipped => {
                    attempted.insert(result.record.id.clone());
                    report.skipped += 1;
                }
                ApplyOutcome::Failed { entity, auth } => {
                    attempted.insert(result.record.id.clone());
                    if auth {
                        // credentials are broken for everything else too
                        self.cancel.store(true, Ordering::Relaxed);
                    }
                    warn!(
                        attachment = %entity.name,
                        error = %entity.error,
                        "attachment failed, continuing"
                    );
                    report.failed.push(entity);
                }
            }
        }

        attempted
    }

    fn record_failure(
        &self,
        report: &mut SyncReport,
        kind: EntityKind,
        record: &EntityRecord,
        err: SyncError,
    ) {
        if matches!(err, SyncError::Auth { .. }) {
            self.cancel.store(true, Ordering::Relaxed);
        }
        warn!(entity = %record.title, error = %err, "entity failed, continuing");
        report.failed.push(FailedEntity {
            kind,
            id: record.id.clone(),
            name: record.title.clone(),
            error: err.to_string(),
        });
    }
}

struct AttachmentResult {
    record: EntityRecord,
    outcome: ApplyOutcome,
}

enum ApplyOutcome {
    Uploaded(String),
    Skipped,
    Failed { entity: FailedEntity, auth: bool },
    NotAttempted,
}

/// Download, classify, extract, and upload one attachment.
async fn apply_attachment(
    source: Arc<dyn SourceClient>,
    gateway: Arc<dyn DestinationGateway>,
    describer: Option<Arc<dyn ImageDescriber>>,
    collection_id: &str,
    record: &EntityRecord,
) -> ApplyOutcome {
    let class = classify(&record.title);
    if class == AttachmentClass::Unsupported {
        warn!(attachment = %record.title, "no extractor for this attachment, skipping");
        return ApplyOutcome::Skipped;
    }

    let name = destination_name(&record.title);
    let failed = |err: SyncError| ApplyOutcome::Failed {
        auth: matches!(err, SyncError::Auth { .. }),
        entity: FailedEntity {
            kind: EntityKind::Attachment,
            id: record.id.clone(),
            name: name.clone(),
            error: err.to_string(),
        },
    };

    let page_id = record.parent_id.as_deref().unwrap_or_default();
    let bytes = match source.download_attachment(page_id, record).await {
        Ok(bytes) => bytes,
        Err(err) => return failed(err),
    };

    let result = match class {
        AttachmentClass::Image => {
            let Some(describer) = describer else {
                warn!(attachment = %record.title, "no image describer configured, skipping");
                return ApplyOutcome::Skipped;
            };
            match describer.describe(&record.title, &bytes).await {
                Ok(text) => gateway.upsert_text_document(collection_id, &name, &text).await,
                Err(err) => return failed(err),
            }
        }
        AttachmentClass::Tabular => match extract_tabular_text(&record.title, &bytes) {
            Ok(text) => gateway.upsert_text_document(collection_id, &name, &text).await,
            Err(err) => return failed(err),
        },
        AttachmentClass::Generic => {
            gateway
                .upsert_file_document(collection_id, &name, &bytes)
                .await
        }
        AttachmentClass::Unsupported => unreachable!("filtered above"),
    };

    match result {
        Ok(()) => {
            info!(attachment = %record.title, document = %name, "upserted attachment document");
            ApplyOutcome::Uploaded(name.clone())
        }
        Err(err) => failed(err),
    }
}

/// Merge the observed snapshot with the previous one so that only
/// dispatched work is recorded as synced.
///
/// Attempted entities (successes and recorded failures alike) persist at
/// their observed version. Entities the pass never reached keep their
/// previous record — an unreached add is omitted, an unreached update
/// keeps the old version, an unreached removal keeps the old record — so
/// the next pass diffs them as pending again.
fn persisted_snapshot(
    previous: &[EntityRecord],
    current: &[EntityRecord],
    diff: &DiffResult,
    attempted: &HashSet<String>,
    attempted_removals: &HashSet<String>,
) -> Snapshot {
    let prev_by_id: HashMap<&str, &EntityRecord> =
        previous.iter().map(|r| (r.id.as_str(), r)).collect();
    let added: HashSet<&str> = diff.added.iter().map(|r| r.id.as_str()).collect();
    let updated: HashSet<&str> = diff.updated.iter().map(|r| r.id.as_str()).collect();
    let removed: HashSet<&str> = diff.removed.iter().map(|r| r.id.as_str()).collect();

    let mut out = Vec::with_capacity(current.len());
    for record in current {
        let id = record.id.as_str();
        if added.contains(id) && !attempted.contains(id) {
            continue;
        }
        if updated.contains(id) && !attempted.contains(id) {
            if let Some(old) = prev_by_id.get(id) {
                out.push((*old).clone());
            }
            continue;
        }
        out.push(record.clone());
    }

    for record in previous {
        if removed.contains(record.id.as_str()) && !attempted_removals.contains(&record.id) {
            out.push(record.clone());
        }
    }

    out
}
