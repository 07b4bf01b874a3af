//! Wiki source client.
//!
//! Paginated read access to the content source: pages in a space, a page's
//! rendered body, per-page attachment listings, and attachment downloads.
//! All requests carry basic auth. 401/403 surface as credential errors;
//! every other failure aborts the listing in progress — partial listings
//! are discarded, never returned as snapshots.

use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

use crate::config::{SourceConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::{EntityRecord, Snapshot};

/// Read access to the content source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Check that the configured credentials are accepted.
    async fn verify_credentials(&self) -> SyncResult<()>;

    /// Complete listing of the pages in a space.
    async fn list_pages(&self, space_key: &str) -> SyncResult<Snapshot>;

    /// Rendered export body of one page (raw markup).
    async fn fetch_page_body(&self, page_id: &str) -> SyncResult<String>;

    /// Complete listing of one page's attachments. Records carry
    /// `parent_id = page_id`.
    async fn list_attachments(&self, page_id: &str) -> SyncResult<Snapshot>;

    /// Raw bytes of one attachment.
    async fn download_attachment(&self, page_id: &str, record: &EntityRecord)
        -> SyncResult<Vec<u8>>;
}

/// Exhaustively fetch fixed-size batches starting at offset 0.
///
/// The source reports no total count; the only termination signal is a
/// batch shorter than `page_size`. A listing whose size is an exact
/// multiple of `page_size` therefore costs one extra (empty) fetch.
pub async fn paginate<F, Fut>(page_size: usize, mut fetch: F) -> SyncResult<Snapshot>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = SyncResult<Snapshot>>,
{
    let mut all = Vec::new();
    let mut offset = 0;
    loop {
        let batch = fetch(offset).await?;
        let fetched = batch.len();
        all.extend(batch);
        if fetched < page_size {
            break;
        }
        offset += page_size;
    }
    Ok(all)
}

/// HTTP client for the wiki REST API.
pub struct WikiClient {
    http: reqwest::Client,
    site_root: String,
    email: String,
    api_token: String,
    page_size: usize,
}

impl WikiClient {
    pub fn new(source: &SourceConfig, sync: &SyncConfig, api_token: String) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(sync.timeout_secs))
            .build()
            .map_err(|e| SyncError::source_unavailable(e.to_string()))?;

        Ok(Self {
            http,
            site_root: source.site_root(),
            email: source.email.clone(),
            api_token,
            page_size: sync.page_size,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> SyncResult<T> {
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.email, Some(&self.api_token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SyncError::source_unavailable(format!("{url}: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SyncError::Auth {
                service: "source",
                message: format!("HTTP {status} from {url}"),
            });
        }
        if !status.is_success() {
            return Err(SyncError::source_unavailable(format!(
                "HTTP {status} from {url}"
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| SyncError::source_unavailable(format!("invalid response from {url}: {e}")))
    }

    async fn fetch_page_batch(&self, space_key: &str, offset: usize) -> SyncResult<Snapshot> {
        let url = format!(
            "{}/wiki/rest/api/content?type=page&spaceKey={}&limit={}&start={}&expand=version",
            self.site_root,
            encode_segment(space_key),
            self.page_size,
            offset
        );
        let list: RestContentList = self.get_json(&url).await?;
        Ok(list.results.into_iter().map(RestContent::into_record).collect())
    }

    async fn fetch_attachment_batch(&self, page_id: &str, offset: usize) -> SyncResult<Snapshot> {
        let url = format!(
            "{}/wiki/rest/api/content/{}/child/attachment?limit={}&start={}&expand=version",
            self.site_root, page_id, self.page_size, offset
        );
        let list: RestContentList = self.get_json(&url).await?;
        Ok(list
            .results
            .into_iter()
            .map(|item| item.into_record().with_parent(page_id))
            .collect())
    }
}

#[async_trait]
impl SourceClient for WikiClient {
    async fn verify_credentials(&self) -> SyncResult<()> {
        let url = format!("{}/wiki/rest/api/user/current", self.site_root);
        let _: serde_json::Value = self.get_json(&url).await?;
        Ok(())
    }

    async fn list_pages(&self, space_key: &str) -> SyncResult<Snapshot> {
        paginate(self.page_size, |offset| {
            self.fetch_page_batch(space_key, offset)
        })
        .await
    }

    async fn fetch_page_body(&self, page_id: &str) -> SyncResult<String> {
        let url = format!(
            "{}/wiki/rest/api/content/{}?expand=body.export_view",
            self.site_root, page_id
        );
        let content: RestContentWithBody = self.get_json(&url).await?;
        Ok(content
            .body
            .and_then(|b| b.export_view)
            .map(|v| v.value)
            .unwrap_or_default())
    }

    async fn list_attachments(&self, page_id: &str) -> SyncResult<Snapshot> {
        paginate(self.page_size, |offset| {
            self.fetch_attachment_batch(page_id, offset)
        })
        .await
    }

    async fn download_attachment(
        &self,
        page_id: &str,
        record: &EntityRecord,
    ) -> SyncResult<Vec<u8>> {
        let url = format!(
            "{}/wiki/download/attachments/{}/{}",
            self.site_root,
            page_id,
            encode_segment(&record.title)
        );

        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.email, Some(&self.api_token))
            .send()
            .await
            .map_err(|e| SyncError::source_unavailable(format!("{url}: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SyncError::Auth {
                service: "source",
                message: format!("HTTP {status} from {url}"),
            });
        }
        if !status.is_success() {
            return Err(SyncError::source_unavailable(format!(
                "HTTP {status} downloading {}",
                record.title
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SyncError::source_unavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// ============ REST response shapes ============

#[derive(Debug, Deserialize)]
struct RestContentList {
    #[serde(default)]
    results: Vec<RestContent>,
}

#[derive(Debug, Deserialize)]
struct RestContent {
    id: String,
    title: String,
    #[serde(default)]
    version: Option<RestVersion>,
}

#[derive(Debug, Deserialize)]
struct RestVersion {
    #[serde(default)]
    when: Option<String>,
}

impl RestContent {
    fn into_record(self) -> EntityRecord {
        let version = self.version.and_then(|v| v.when).unwrap_or_default();
        EntityRecord::new(self.id, self.title, version)
    }
}

#[derive(Debug, Deserialize)]
struct RestContentWithBody {
    #[serde(default)]
    body: Option<RestBody>,
}

#[derive(Debug, Deserialize)]
struct RestBody {
    #[serde(default)]
    export_view: Option<RestBodyValue>,
}

#[derive(Debug, Deserialize)]
struct RestBodyValue {
    #[serde(default)]
    value: String,
}

/// Percent-encode one URL path segment per RFC 3986 (unreserved characters
/// pass through).
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn batch(from: usize, count: usize) -> Snapshot {
        (from..from + count)
            .map(|i| EntityRecord::new(i.to_string(), format!("p{i}"), "v1"))
            .collect()
    }

    #[tokio::test]
    async fn pagination_stops_on_short_batch() {
        let calls = Cell::new(0usize);
        let result = paginate(2, |offset| {
            calls.set(calls.get() + 1);
            let out = if offset == 0 { batch(0, 2) } else { batch(2, 1) };
            async move { Ok(out) }
        })
        .await
        .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn exact_multiple_costs_one_extra_fetch() {
        // 4 records at page size 2: offsets 0 and 2 fill up, offset 4 is
        // the empty terminating fetch.
        let calls = Cell::new(0usize);
        let result = paginate(2, |offset| {
            calls.set(calls.get() + 1);
            let out = if offset < 4 { batch(offset, 2) } else { Vec::new() };
            async move { Ok(out) }
        })
        .await
        .unwrap();

        assert_eq!(result.len(), 4);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn empty_listing_is_a_single_fetch() {
        let calls = Cell::new(0usize);
        let result = paginate(50, |_offset| {
            calls.set(calls.get() + 1);
            async move { Ok(Vec::new()) }
        })
        .await
        .unwrap();

        assert!(result.is_empty());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn fetch_error_discards_partial_results() {
        let calls = Cell::new(0usize);
        let result: SyncResult<Snapshot> = paginate(2, |offset| {
            calls.set(calls.get() + 1);
            let out = if offset == 0 {
                Ok(batch(0, 2))
            } else {
                Err(SyncError::source_unavailable("HTTP 503"))
            };
            async move { out }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn segment_encoding_escapes_reserved_characters() {
        assert_eq!(encode_segment("design doc.pdf"), "design%20doc.pdf");
        assert_eq!(encode_segment("a#b?c"), "a%23b%3Fc");
        assert_eq!(encode_segment("plain-name_1.txt"), "plain-name_1.txt");
    }
}
