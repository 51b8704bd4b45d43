//! In-memory test doubles for `IndexTarget` and `DocumentProcessor`, used
//! across crates' test suites so engine/detector tests don't need a real
//! vector store, search engine, or graph database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::SyncError;
use crate::traits::{DocumentProcessor, IndexTarget, ParsedDocument};
use crate::types::FileMetadata;

/// Records every upsert/delete it sees; `contains` reflects current state.
#[derive(Default)]
pub struct RecordingIndexTarget {
    name: &'static str,
    docs: Mutex<HashMap<String, (String, JsonValue)>>,
}

impl RecordingIndexTarget {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            docs: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains_doc(&self, doc_id: &str) -> bool {
        self.docs.lock().unwrap().contains_key(doc_id)
    }

    pub fn text(&self, doc_id: &str) -> Option<String> {
        self.docs.lock().unwrap().get(doc_id).map(|(text, _)| text.clone())
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IndexTarget for RecordingIndexTarget {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn upsert(&self, doc_id: &str, extracted_text: &str, metadata: &JsonValue) -> Result<(), SyncError> {
        self.docs
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), (extracted_text.to_string(), metadata.clone()));
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<(), SyncError> {
        self.docs.lock().unwrap().remove(doc_id);
        Ok(())
    }

    async fn contains(&self, doc_id: &str) -> Result<Option<bool>, SyncError> {
        Ok(Some(self.docs.lock().unwrap().contains_key(doc_id)))
    }
}

/// Treats the input bytes as UTF-8 text and hands back one document.
pub struct PassthroughDocumentProcessor;

#[async_trait]
impl DocumentProcessor for PassthroughDocumentProcessor {
    async fn process(&self, bytes: &[u8], metadata: &FileMetadata) -> Result<Vec<ParsedDocument>, SyncError> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        Ok(vec![ParsedDocument {
            doc_id: metadata.path.clone(),
            text,
            ordinal: metadata.ordinal,
            metadata: serde_json::json!({ "path": metadata.path }),
        }])
    }
}
