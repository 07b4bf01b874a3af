//! Destination knowledge-base gateway.
//!
//! The destination exposes a flat, name-keyed document namespace per
//! collection with only coarse operations: create collection, create
//! document from text or file, delete document by id, list. Upsert is
//! therefore modeled as delete-if-exists-by-name followed by create, which
//! keeps every operation idempotent and guarantees a name never maps to
//! two documents.
//!
//! Transient failures (timeouts, 429, 5xx) are retried with exponential
//! backoff — 1s, 2s, 4s, ... capped — up to the configured attempt count
//! before surfacing `DestinationUnavailable`. 401/403 are credential
//! errors and never retried.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::{DestinationConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};

/// Result of resolving a destination collection.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    pub id: String,
    /// True when the collection was created by this call; the reconciler
    /// resets its cached state in that case, since no prior cache can be
    /// valid for a brand-new collection.
    pub created: bool,
}

/// One document as listed by the destination.
#[derive(Debug, Clone)]
pub struct DocumentRef {
    pub id: String,
    pub name: String,
}

/// One retrieved chunk from a destination query.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub content: String,
    pub document_name: String,
    pub score: f64,
}

/// Write and query access to the destination index.
#[async_trait]
pub trait DestinationGateway: Send + Sync {
    /// Look a collection up by exact name, creating it when absent.
    async fn get_or_create_collection(&self, name: &str) -> SyncResult<CollectionHandle>;

    /// List all documents in a collection.
    async fn list_documents(&self, collection_id: &str) -> SyncResult<Vec<DocumentRef>>;

    /// Replace-or-create a text document under `name`.
    async fn upsert_text_document(
        &self,
        collection_id: &str,
        name: &str,
        text: &str,
    ) -> SyncResult<()>;

    /// Replace-or-create a file document under `name`.
    async fn upsert_file_document(
        &self,
        collection_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> SyncResult<()>;

    /// Delete the document stored under `name`; absence is a no-op so a
    /// retried deletion cannot fail.
    async fn delete_document_by_name(&self, collection_id: &str, name: &str) -> SyncResult<()>;

    /// Query the collection for relevant chunks.
    async fn retrieve(
        &self,
        collection_id: &str,
        query: &str,
        top_k: usize,
    ) -> SyncResult<Vec<RetrievedChunk>>;
}

const LIST_PAGE_LIMIT: usize = 100;

/// HTTP client for the knowledge-base REST API.
///
/// Holds its API key as an explicit constructor argument; one instance per
/// process, injected wherever destination access is needed.
pub struct KnowledgeBaseClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl KnowledgeBaseClient {
    pub fn new(
        destination: &DestinationConfig,
        sync: &SyncConfig,
        api_key: String,
    ) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(sync.timeout_secs))
            .build()
            .map_err(|e| SyncError::destination_unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: destination.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: sync.max_retries,
        })
    }

    /// Send a request, retrying transient failures with exponential backoff.
    ///
    /// `build` constructs a fresh request for each attempt (request bodies,
    /// multipart forms included, are not reusable across sends).
    async fn send_with_retry<F>(&self, label: &str, build: F) -> SyncResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s, 8s, ... capped at 32s
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = build().bearer_auth(&self.api_key).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(SyncError::Auth {
                            service: "destination",
                            message: format!("HTTP {status} on {label}"),
                        });
                    }

                    // rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        last_err = Some(format!("HTTP {status} on {label}: {body}"));
                        continue;
                    }

                    // other client errors are not retryable
                    let body = response.text().await.unwrap_or_default();
                    return Err(SyncError::destination_unavailable(format!(
                        "HTTP {status} on {label}: {body}"
                    )));
                }
                Err(e) => {
                    last_err = Some(format!("{label}: {e}"));
                    continue;
                }
            }
        }

        Err(SyncError::destination_unavailable(last_err.unwrap_or_else(
            || format!("{label} failed after retries"),
        )))
    }

    async fn list_collections(&self) -> SyncResult<Vec<DocumentRef>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/datasets?page={}&limit={}",
                self.base_url, page, LIST_PAGE_LIMIT
            );
            let resp = self
                .send_with_retry("list collections", || self.http.get(&url))
                .await?;
            let listing: RestListing = resp
                .json()
                .await
                .map_err(|e| SyncError::destination_unavailable(e.to_string()))?;

            let fetched = listing.data.len();
            all.extend(
                listing
                    .data
                    .into_iter()
                    .map(|item| DocumentRef {
                        id: item.id,
                        name: item.name,
                    }),
            );
            if fetched < LIST_PAGE_LIMIT {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn find_document(
        &self,
        collection_id: &str,
        name: &str,
    ) -> SyncResult<Option<DocumentRef>> {
        let documents = self.list_documents(collection_id).await?;
        Ok(documents.into_iter().find(|doc| doc.name == name))
    }
}

#[async_trait]
impl DestinationGateway for KnowledgeBaseClient {
    async fn get_or_create_collection(&self, name: &str) -> SyncResult<CollectionHandle> {
        for collection in self.list_collections().await? {
            if collection.name == name {
                return Ok(CollectionHandle {
                    id: collection.id,
                    created: false,
                });
            }
        }

        let url = format!("{}/datasets", self.base_url);
        let payload = serde_json::json!({
            "name": name,
            "description": format!("Knowledge base for {name}"),
            "indexing_technique": "high_quality",
        });
        let resp = self
            .send_with_retry("create collection", || self.http.post(&url).json(&payload))
            .await?;
        let created: RestCreated = resp
            .json()
            .await
            .map_err(|e| SyncError::destination_unavailable(e.to_string()))?;

        Ok(CollectionHandle {
            id: created.id,
            created: true,
        })
    }

    async fn list_documents(&self, collection_id: &str) -> SyncResult<Vec<DocumentRef>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/datasets/{}/documents?page={}&limit={}",
                self.base_url, collection_id, page, LIST_PAGE_LIMIT
            );
            let resp = self
                .send_with_retry("list documents", || self.http.get(&url))
                .await?;
            let listing: RestListing = resp
                .json()
                .await
                .map_err(|e| SyncError::destination_unavailable(e.to_string()))?;

            let fetched = listing.data.len();
            all.extend(listing.data.into_iter().map(|item| DocumentRef {
                id: item.id,
                name: item.name,
            }));
            if fetched < LIST_PAGE_LIMIT {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn upsert_text_document(
        &self,
        collection_id: &str,
        name: &str,
        text: &str,
    ) -> SyncResult<()> {
        self.delete_document_by_name(collection_id, name).await?;

        let url = format!(
            "{}/datasets/{}/document/create-by-text",
            self.base_url, collection_id
        );
        let payload = serde_json::json!({
            "name": name,
            "text": text,
            "indexing_technique": "high_quality",
            "process_rule": {
                "mode": "custom",
                "rules": {
                    "pre_processing_rules": [
                        { "id": "remove_extra_spaces", "enabled": true },
                    ],
                    "segmentation": {
                        "separator": "\n\n",
                        "max_tokens": 1024,
                        "chunk_overlap": 100,
                    },
                },
            },
        });

        self.send_with_retry("create text document", || {
            self.http.post(&url).json(&payload)
        })
        .await?;
        Ok(())
    }

    async fn upsert_file_document(
        &self,
        collection_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> SyncResult<()> {
        self.delete_document_by_name(collection_id, name).await?;

        let url = format!(
            "{}/datasets/{}/document/create-by-file",
            self.base_url, collection_id
        );
        let rules = serde_json::json!({
            "indexing_technique": "high_quality",
            "process_rule": {
                "mode": "custom",
                "rules": {
                    "pre_processing_rules": [
                        { "id": "remove_extra_spaces", "enabled": true },
                        { "id": "remove_urls_emails", "enabled": true },
                    ],
                    "segmentation": {
                        "separator": "\n\n",
                        "max_tokens": 2048,
                        "chunk_overlap": 200,
                    },
                },
            },
        })
        .to_string();

        let owned_name = name.to_string();
        let owned_bytes = bytes.to_vec();
        self.send_with_retry("create file document", || {
            let form = reqwest::multipart::Form::new()
                .text("data", rules.clone())
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(owned_bytes.clone())
                        .file_name(owned_name.clone()),
                );
            self.http.post(&url).multipart(form)
        })
        .await?;
        Ok(())
    }

    async fn delete_document_by_name(&self, collection_id: &str, name: &str) -> SyncResult<()> {
        let Some(doc) = self.find_document(collection_id, name).await? else {
            return Ok(());
        };

        let url = format!(
            "{}/datasets/{}/documents/{}",
            self.base_url, collection_id, doc.id
        );
        match self
            .send_with_retry("delete document", || self.http.delete(&url))
            .await
        {
            Ok(_) => Ok(()),
            // deleted concurrently between listing and delete: already gone
            Err(SyncError::DestinationUnavailable(msg)) if msg.contains("404") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn retrieve(
        &self,
        collection_id: &str,
        query: &str,
        top_k: usize,
    ) -> SyncResult<Vec<RetrievedChunk>> {
        let url = format!("{}/datasets/{}/retrieve", self.base_url, collection_id);
        let payload = serde_json::json!({
            "query": query,
            "retrieval_model": {
                "search_method": "hybrid_search",
                "reranking_enable": false,
                "weights": { "bm25": 0.4, "embedding": 0.6 },
                "top_k": top_k,
                "score_threshold_enabled": false,
            },
        });

        let resp = self
            .send_with_retry("retrieve", || self.http.post(&url).json(&payload))
            .await?;
        let result: RestRetrieval = resp
            .json()
            .await
            .map_err(|e| SyncError::destination_unavailable(e.to_string()))?;

        Ok(result
            .records
            .into_iter()
            .map(|record| RetrievedChunk {
                content: record.segment.content,
                document_name: record
                    .segment
                    .document
                    .map(|d| d.name)
                    .unwrap_or_default(),
                score: record.score.unwrap_or(0.0),
            })
            .collect())
    }
}

// ============ REST response shapes ============

#[derive(Debug, Deserialize)]
struct RestListing {
    #[serde(default)]
    data: Vec<RestNamed>,
}

#[derive(Debug, Deserialize)]
struct RestNamed {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RestCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RestRetrieval {
    #[serde(default)]
    records: Vec<RestRetrievalRecord>,
}

#[derive(Debug, Deserialize)]
struct RestRetrievalRecord {
    segment: RestSegment,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RestSegment {
    #[serde(default)]
    content: String,
    #[serde(default)]
    document: Option<RestDocumentName>,
}

#[derive(Debug, Deserialize)]
struct RestDocumentName {
    name: String,
}
