//! Error taxonomy and retry policy
//!
//! Every failure that crosses a component boundary is a [`DownloadError`]. The
//! variants mirror the pipeline stages (resolution, extraction, fetch, merge,
//! persistence) so a failed job records exactly which stage gave up and why.
//!
//! Key features:
//! - Reason enums per stage, serializable so `last_error` survives restarts
//! - Retry classification through [`DownloadError::is_retryable`]
//! - Exponential backoff with jitter via [`RetryPolicy`]

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Maximum retry attempts allowed by configuration validation
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Default base delay for exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff (30 seconds)
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(30);

/// Why extracting a media manifest from a page failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionFailure {
    /// Page could not be loaded (connect error, timeout, 5xx, renderer crash)
    PageUnreachable,
    /// The page loaded but the structure the extractor relies on is gone
    MarkupChanged,
    /// Page parsed fine but advertises no playable stream
    NoStreamsFound,
    /// Site requires a login or rejected the request
    AuthRequired,
}

/// Why a stream transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchFailure {
    Network,
    Timeout,
    ServerError,
    /// Source rejected the request (4xx other than 408/429)
    Rejected,
    /// Bytes on disk do not match the advertised size
    IntegrityMismatch,
    /// Writing the partial file failed (disk full, permissions, missing dir)
    LocalIo,
}

/// Why combining streams failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MuxFailure {
    IncompatibleCodecs,
    ToolUnavailable,
    IoError,
}

/// Errors produced by the download pipeline
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DownloadError {
    #[error("No extractor supports {url}")]
    NotSupported { url: String },

    #[error("Extraction failed ({reason:?}): {message}")]
    Extraction {
        reason: ExtractionFailure,
        message: String,
    },

    #[error("Fetch failed ({reason:?}): {message} (status: {status:?})")]
    Fetch {
        reason: FetchFailure,
        message: String,
        status: Option<u16>,
    },

    #[error("Merge failed ({reason:?}): {message}")]
    Mux { reason: MuxFailure, message: String },

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Determine if this error should be retried by the stage that produced it
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Extraction { reason, .. } => *reason == ExtractionFailure::PageUnreachable,
            Self::Fetch { reason, .. } => matches!(
                reason,
                FetchFailure::Network | FetchFailure::Timeout | FetchFailure::ServerError
            ),
            _ => false,
        }
    }

    /// Short stage label used in log lines
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotSupported { .. } => "resolve",
            Self::Extraction { .. } => "extract",
            Self::Fetch { .. } => "fetch",
            Self::Mux { .. } => "merge",
            Self::Store(_) | Self::JobNotFound(_) => "store",
            Self::Configuration(_) => "config",
            Self::InvalidTransition { .. } => "state",
            Self::Cancelled => "cancel",
        }
    }

    pub fn fetch_reason(&self) -> Option<FetchFailure> {
        match self {
            Self::Fetch { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;

/// Retry strategy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Add random jitter to prevent thundering herd
    pub jitter_enabled: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// A policy without jitter, handy when delays must be predictable
    pub fn fixed(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay,
            backoff_multiplier: 1.0,
            jitter_enabled: false,
            jitter_factor: 0.0,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let mut delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter_enabled && self.jitter_factor > 0.0 {
            let jitter =
                delay.as_millis() as f64 * self.jitter_factor * (rand::random::<f64>() - 0.5);
            let jittered = delay.as_millis() as i64 + jitter as i64;
            delay = Duration::from_millis(jittered.max(0) as u64);
        }

        delay
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt ceiling is reached. The last error is returned verbatim.
    pub async fn run<F, Fut, T>(&self, label: &str, mut op: F) -> DownloadResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DownloadResult<T>>,
    {
        let mut attempt = 1;
        loop {
            debug!("Executing attempt {} for {}", attempt, label);
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "{} failed on attempt {}/{}: {}. Retrying in {:?}",
                        label, attempt, self.max_attempts, err, delay
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Convenience constructors for common errors
pub mod errors {
    use super::*;

    pub fn extraction(reason: ExtractionFailure, message: impl Into<String>) -> DownloadError {
        DownloadError::Extraction {
            reason,
            message: message.into(),
        }
    }

    pub fn markup_changed(message: impl Into<String>) -> DownloadError {
        extraction(ExtractionFailure::MarkupChanged, message)
    }

    pub fn no_streams(message: impl Into<String>) -> DownloadError {
        extraction(ExtractionFailure::NoStreamsFound, message)
    }

    pub fn fetch(reason: FetchFailure, message: impl Into<String>) -> DownloadError {
        DownloadError::Fetch {
            reason,
            message: message.into(),
            status: None,
        }
    }

    /// Map an HTTP status to the fetch taxonomy: 5xx, 408 and 429 are transient
    pub fn fetch_status(status: u16, url: &str) -> DownloadError {
        let reason = if status >= 500 || status == 408 || status == 429 {
            FetchFailure::ServerError
        } else {
            FetchFailure::Rejected
        };
        DownloadError::Fetch {
            reason,
            message: format!("HTTP {} from {}", status, url),
            status: Some(status),
        }
    }

    /// Local filesystem failure while fetching; never retried
    pub fn io(context: &str, err: std::io::Error) -> DownloadError {
        fetch(FetchFailure::LocalIo, format!("{}: {}", context, err))
    }

    pub fn mux(reason: MuxFailure, message: impl Into<String>) -> DownloadError {
        DownloadError::Mux {
            reason,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> DownloadError {
        DownloadError::Store(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_classification() {
        assert!(errors::extraction(ExtractionFailure::PageUnreachable, "x").is_retryable());
        assert!(!errors::markup_changed("x").is_retryable());
        assert!(!errors::extraction(ExtractionFailure::AuthRequired, "x").is_retryable());
        assert!(errors::fetch(FetchFailure::Timeout, "x").is_retryable());
        assert!(errors::fetch_status(503, "http://a").is_retryable());
        assert!(errors::fetch_status(429, "http://a").is_retryable());
        assert!(!errors::fetch_status(404, "http://a").is_retryable());
        assert!(!errors::fetch(FetchFailure::IntegrityMismatch, "x").is_retryable());
        let disk_full = std::io::Error::new(std::io::ErrorKind::Other, "No space left on device");
        let err = errors::io("write partial", disk_full);
        assert_eq!(err.fetch_reason(), Some(FetchFailure::LocalIo));
        assert!(!err.is_retryable());
        assert!(!DownloadError::NotSupported { url: "x".into() }.is_retryable());
        assert!(!DownloadError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_survives_serde() {
        let err = errors::fetch_status(502, "http://cdn/v.m4s");
        let json = serde_json::to_string(&err).unwrap();
        let back: DownloadError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.fetch_reason(), Some(FetchFailure::ServerError));
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy {
            jitter_enabled: false,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1).as_millis();
            assert!((900..=1100).contains(&d), "delay {} out of band", d);
        }
    }

    #[tokio::test]
    async fn test_run_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let counter = calls.clone();
        let result = policy
            .run("flaky", move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(errors::fetch(FetchFailure::Network, "reset"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let counter = calls.clone();
        let result: DownloadResult<()> = policy
            .run("auth", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(errors::extraction(ExtractionFailure::AuthRequired, "login")) }
            })
            .await;
        assert!(matches!(
            result,
            Err(DownloadError::Extraction {
                reason: ExtractionFailure::AuthRequired,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_returns_last_error_when_exhausted() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let result: DownloadResult<()> = policy
            .run("down", |attempt| async move {
                Err(errors::fetch(FetchFailure::ServerError, format!("try {}", attempt)))
            })
            .await;
        match result {
            Err(DownloadError::Fetch { message, .. }) => assert_eq!(message, "try 2"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
