//! `ChangeDetector` implementations for every source kind a
//! `DataSourceConfig` can name, plus the shared debounce/known-ids
//! building blocks they're built from and the factory that turns a
//! config row into a boxed detector.

pub mod alfresco_broadcaster;
pub mod base;
pub mod detectors;
pub mod factory;

pub use alfresco_broadcaster::{StompBroadcasterRegistry, StompConnection};
pub use base::{requeue_as_create, DebounceTracker, KnownIds, StartTimeFilter, DEFAULT_DEBOUNCE_WINDOW};
pub use detectors::alfresco::AlfrescoDetector;
pub use detectors::azure_blob::AzureBlobDetector;
pub use detectors::box_detector::BoxDetector;
pub use detectors::filesystem::FilesystemDetector;
pub use detectors::gcs::GcsDetector;
pub use detectors::google_drive::GoogleDriveDetector;
pub use detectors::onedrive_sharepoint::MsGraphDetector;
pub use detectors::s3::S3Detector;
pub use factory::DetectorFactory;
