//! Shared helpers: error types and connection backoff.

pub mod error;
pub mod retry;

pub use error::{ConfigError, SapError, StorageError};
pub use retry::{RetryHandle, RetryPolicy};
