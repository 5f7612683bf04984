use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "multisite_video_downloader=info";

/// `RUST_LOG` wins; otherwise this crate logs at `level`
pub fn build_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => format!("multisite_video_downloader={}", level).into(),
        None => DEFAULT_FILTER.into(),
    })
}

pub fn init_tracing() {
    init_tracing_with_level(None);
}

/// Install the fmt subscriber; repeated calls are ignored
pub fn init_tracing_with_level(level: Option<&str>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(level))
        .try_init();
}
