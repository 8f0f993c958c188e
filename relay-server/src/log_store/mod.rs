//! Append-only log storage used as the source of truth for conversation history.
//!
//! The relay talks to the store only through [`LogStore`] and [`LogConsumer`]:
//! publish a payload to a subject and get back a store-wide sequence, or open
//! an ephemeral consumer over a subject filter and fetch bounded batches.

pub mod jetstream;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use jetstream::JetStreamLogStore;
pub use memory::MemoryLogStore;

/// Failures reported by a log store adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogStoreError {
    /// The store could not be reached.
    #[error("log store connection failed: {0}")]
    Connection(String),
    /// Stream provisioning failed.
    #[error("log store stream setup failed: {0}")]
    Stream(String),
    /// A publish was rejected.
    #[error("publish rejected: {0}")]
    Publish(String),
    /// An operation did not complete in time.
    #[error("log store operation timed out after {0:?}")]
    Timeout(Duration),
    /// A consumer could not be created.
    #[error("consumer creation failed: {0}")]
    Consumer(String),
    /// A fetch failed.
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// Result alias for log store calls.
pub type LogStoreResult<T> = Result<T, LogStoreError>;

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// From the first retained record.
    All,
    /// From the given sequence, inclusive.
    ByStartSequence(u64),
}

impl DeliverPolicy {
    /// Policy that resumes strictly after `cursor`; `0` means the beginning.
    ///
    /// Returns `None` for `u64::MAX`, after which nothing can be recorded.
    #[must_use]
    pub fn after(cursor: u64) -> Option<Self> {
        match cursor {
            0 => Some(DeliverPolicy::All),
            _ => cursor.checked_add(1).map(DeliverPolicy::ByStartSequence),
        }
    }
}

/// A committed record as returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Subject the record was published to.
    pub subject: String,
    /// Store-wide sequence.
    pub sequence: u64,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Outcome of one fetch.
///
/// `terminal_error` is set when the batch ended because of a failure rather
/// than because it filled up or the wait elapsed; records received before the
/// failure are still returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchBatch {
    /// Records in ascending sequence order.
    pub records: Vec<StoredRecord>,
    /// Failure that cut the batch short.
    pub terminal_error: Option<LogStoreError>,
}

/// Durable append-only log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Short adapter name for logs.
    fn backend(&self) -> &'static str;

    /// Whether the adapter currently has a live connection.
    fn is_connected(&self) -> bool;

    /// Creates the backing stream if it does not exist.
    async fn ensure_stream(&self) -> LogStoreResult<()>;

    /// Appends `payload` to `subject`, returning the committed sequence.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> LogStoreResult<u64>;

    /// Opens an ephemeral consumer over `filter`.
    ///
    /// Consumers hold no state beyond their own lifetime and are never reused.
    async fn create_consumer(
        &self,
        filter: &str,
        policy: DeliverPolicy,
    ) -> LogStoreResult<Box<dyn LogConsumer>>;
}

/// Ephemeral cursor over a filtered subject space.
#[async_trait]
pub trait LogConsumer: Send {
    /// Returns up to `max_count` records, or fewer once `max_wait` elapses.
    async fn fetch(&mut self, max_count: usize, max_wait: Duration) -> LogStoreResult<FetchBatch>;
}

/// Matches `subject` against a filter using `*` (one token) and `>` (one or
/// more trailing tokens) wildcards.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
