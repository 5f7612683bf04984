//! Multi-site video downloader - Core Library
//!
//! Resolves a video page URL to its media streams, fetches them with resume
//! support, merges split audio/video and keeps a durable record of every job
//! so interrupted downloads pick up where they stopped.

pub mod core;
pub mod utils;

// Re-export commonly used types
pub use core::{
    batch::{BatchEntry, BatchReport, BatchStatus},
    config::AppConfig,
    coordinator::{CoordinatorBuilder, TransferCoordinator},
    error_handling::{DownloadError, DownloadResult},
    models::{
        JobHandle, JobProgress, JobState, MediaManifest, QualityPreference, StreamDescriptor,
        StreamKind,
    },
    runtime::{spawn_download_runtime, DownloadRuntimeHandle},
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library with default settings
pub fn init() -> anyhow::Result<()> {
    // 重复初始化会被忽略
    utils::logging::init_tracing();
    tracing::info!("📚 {} v{} initialized", NAME, VERSION);
    Ok(())
}

/// Initialize logging at `logging.level` from `config`; `RUST_LOG` still wins
pub fn init_with_config(config: &AppConfig) -> anyhow::Result<()> {
    config.validate()?;
    utils::logging::init_tracing_with_level(Some(&config.logging.level));
    tracing::info!(
        "📚 {} v{} initialized (log level {})",
        NAME,
        VERSION,
        config.logging.level
    );
    Ok(())
}
