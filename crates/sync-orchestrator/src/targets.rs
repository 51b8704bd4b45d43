//! HTTP-backed `IndexTarget`/`DocumentProcessor` implementations.
//!
//! Vector stores, search engines, graph databases, and text extraction
//! are external collaborators this subsystem consumes rather than
//! implements. These clients speak a small REST contract against
//! whatever service sits at `base_url`, the same way the detector
//! variants speak REST against their respective cloud APIs, so the
//! orchestrator binary has a real, runnable default instead of requiring
//! every deployment to write its own glue before anything compiles.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sync_core::{DocumentProcessor, FileMetadata, IndexTarget, ParsedDocument, SyncError};
use tracing::instrument;

/// Upserts to `PUT {base_url}/{target}/{doc_id}`, deletes to
/// `DELETE {base_url}/{target}/{doc_id}`, probes via
/// `GET {base_url}/{target}/{doc_id}`.
pub struct HttpIndexTarget {
    name: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl HttpIndexTarget {
    pub fn new(name: &'static str, base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            name,
            base_url: base_url.into(),
            http,
        }
    }

    fn url(&self, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url.trim_end_matches('/'), self.name, doc_id)
    }
}

#[derive(serde::Serialize)]
struct UpsertBody<'a> {
    text: &'a str,
    metadata: &'a JsonValue,
}

#[async_trait]
impl IndexTarget for HttpIndexTarget {
    fn name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip(self, extracted_text, metadata), fields(target = self.name, doc_id))]
    async fn upsert(&self, doc_id: &str, extracted_text: &str, metadata: &JsonValue) -> Result<(), SyncError> {
        let response = self
            .http
            .put(self.url(doc_id))
            .json(&UpsertBody {
                text: extracted_text,
                metadata,
            })
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("{} upsert request failed: {e}", self.name)))?;
        classify_response(self.name, response).await
    }

    #[instrument(skip(self), fields(target = self.name, doc_id))]
    async fn delete(&self, doc_id: &str) -> Result<(), SyncError> {
        let response = self
            .http
            .delete(self.url(doc_id))
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("{} delete request failed: {e}", self.name)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND || response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        classify_response(self.name, response).await
    }

    async fn contains(&self, doc_id: &str) -> Result<Option<bool>, SyncError> {
        let response = self
            .http
            .get(self.url(doc_id))
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("{} contains request failed: {e}", self.name)))?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(Some(true)),
            reqwest::StatusCode::NOT_FOUND => Ok(Some(false)),
            _ => Ok(None),
        }
    }
}

async fn classify_response(target: &str, response: reqwest::Response) -> Result<(), SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    // A version conflict on a write means another writer already landed
    // the same or a newer state, which is the outcome this call wanted.
    if status == reqwest::StatusCode::CONFLICT {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(SyncError::Configuration(format!("{target} rejected request ({status}): {body}")))
    } else {
        Err(SyncError::Transient(format!("{target} request failed ({status}): {body}")))
    }
}

/// Sends raw bytes to an external extraction service and parses its
/// response as a list of parsed documents.
pub struct HttpDocumentProcessor {
    extract_url: String,
    http: reqwest::Client,
}

impl HttpDocumentProcessor {
    pub fn new(extract_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            extract_url: extract_url.into(),
            http,
        }
    }
}

#[derive(Deserialize)]
struct ExtractResponseItem {
    text: String,
    #[serde(default)]
    metadata: JsonValue,
}

#[async_trait]
impl DocumentProcessor for HttpDocumentProcessor {
    #[instrument(skip(self, bytes, metadata), fields(path = %metadata.path))]
    async fn process(&self, bytes: &[u8], metadata: &FileMetadata) -> Result<Vec<ParsedDocument>, SyncError> {
        let response = self
            .http
            .post(&self.extract_url)
            .header("content-type", "application/octet-stream")
            .header("x-source-path", &metadata.path)
            .header("x-mime-type", metadata.mime_type.as_deref().unwrap_or("application/octet-stream"))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("extraction request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Transient(format!("extraction service returned {status}: {body}")));
        }

        let items: Vec<ExtractResponseItem> = response
            .json()
            .await
            .map_err(|e| SyncError::Internal(format!("parsing extraction response: {e}")))?;

        Ok(items
            .into_iter()
            .map(|item| ParsedDocument {
                doc_id: metadata.path.clone(),
                text: item.text,
                ordinal: metadata.ordinal,
                metadata: item.metadata,
            })
            .collect())
    }
}
