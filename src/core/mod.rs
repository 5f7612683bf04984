//! Core business logic module
//!
//! Site extraction, resumable stream transfer, job coordination, merging and
//! job persistence.

pub mod bandwidth;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod error_handling;
pub mod extractors;
pub mod format_selector;
pub mod job_store;
pub mod models;
pub mod muxer;
pub mod progress_tracker;
pub mod registry;
pub mod runtime;
pub mod stream_fetcher;
pub mod transport;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod stream_fetcher_integration_tests;


// Re-export commonly used types
pub use config::AppConfig;
pub use coordinator::TransferCoordinator;
