pub mod alfresco;
pub mod azure_blob;
pub mod box_detector;
pub mod filesystem;
pub mod gcs;
pub mod google_drive;
pub mod onedrive_sharepoint;
pub mod s3;
