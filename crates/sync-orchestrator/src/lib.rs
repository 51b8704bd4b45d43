//! `SourceWorker` runs one monitored source's periodic refresh and
//! event-stream loops; `Orchestrator` starts one worker per active
//! config and keeps the set in step with `ConfigStore::watch`.

pub mod config;
pub mod orchestrator;
pub mod targets;
pub mod worker;

pub use config::Config;
pub use orchestrator::{IndexTargetUrls, Orchestrator};
pub use targets::{HttpDocumentProcessor, HttpIndexTarget};
pub use worker::SourceWorker;
