//! Utility modules for mixscope-analyzer

pub mod db_retry;
pub mod resampler;

pub use db_retry::{retry_on_lock, retry_with_backoff};
