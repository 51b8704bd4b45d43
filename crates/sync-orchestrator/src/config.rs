use clap::Parser;

/// Configuration for the sync-orchestrator service.
#[derive(Parser, Debug, Clone)]
#[command(name = "sync-orchestrator")]
#[command(about = "Keeps vector, search, and graph indexes in step with their document sources")]
pub struct Config {
    /// Postgres connection string shared by the config store and the state store.
    #[arg(long, env = "SYNC_DATABASE_URL")]
    pub database_url: String,

    /// Base URL of the vector index's HTTP endpoint. Omit to disable vector sync entirely.
    #[arg(long, env = "SYNC_VECTOR_URL")]
    pub vector_url: Option<String>,

    /// Base URL of the full-text search index's HTTP endpoint. Omit to disable search sync entirely.
    #[arg(long, env = "SYNC_SEARCH_URL")]
    pub search_url: Option<String>,

    /// Base URL of the knowledge-graph index's HTTP endpoint. Omit to disable graph sync entirely.
    #[arg(long, env = "SYNC_GRAPH_URL")]
    pub graph_url: Option<String>,

    /// URL of the document-extraction service that turns raw bytes into parsed text.
    #[arg(long, env = "SYNC_EXTRACT_URL")]
    pub extract_url: String,

    /// Log filter passed to `tracing_subscriber::EnvFilter` when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "SYNC_LOG_LEVEL")]
    pub log_level: String,
}
