//! # Resilience Module
//!
//! Retry with exponential backoff and jitter for idempotent store operations
//! (finds, processed-by updates, deletes, lock removal). Message inserts are
//! never retried through here: a retried insert could duplicate a send.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docbus::config::RetryConfig;
//! use docbus::resilience::with_retry;
//!
//! # async fn example() -> Result<(), docbus::MessagingError> {
//! let retry = RetryConfig::default();
//! let count = with_retry(&retry, "count_messages", || async {
//!     Ok::<u64, docbus::MessagingError>(3)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod retry;

pub use retry::{backoff_delay, with_retry};
