//! Shared types and traits for the incremental synchronization subsystem:
//! the vocabulary every detector, store, and engine crate in the
//! workspace builds on.

pub mod error;
pub mod path_utils;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::SyncError;
pub use path_utils::{make_doc_id, normalize_filesystem_path};
pub use traits::{ChangeDetector, DocumentProcessor, IndexTarget, ParsedDocument};
pub use types::{ChangeEvent, ChangeType, DetectorEvent, FileMetadata, ModifyCallback, SourceType, TargetKind};
