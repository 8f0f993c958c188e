use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::trace;

use super::{
    DeliverPolicy, FetchBatch, LogConsumer, LogStore, LogStoreError, LogStoreResult, StoredRecord,
    subject_matches,
};

/// Process-local log with the same sequencing and consumer semantics as the
/// durable store. Records live only as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: RwLock<Vec<StoredRecord>>,
    appended: Notify,
    failing_publishes: AtomicUsize,
    failing_fetches: AtomicUsize,
    disconnected: AtomicBool,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` fetches with a terminal error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.inner.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Simulates losing or regaining the server connection.
    pub fn set_connected(&self, connected: bool) {
        self.inner.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Snapshot of every committed record.
    pub async fn records(&self) -> Vec<StoredRecord> {
        self.inner.records.read().await.clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        !self.inner.disconnected.load(Ordering::SeqCst)
    }

    async fn ensure_stream(&self) -> LogStoreResult<()> {
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> LogStoreResult<u64> {
        if Self::take_failure(&self.inner.failing_publishes) {
            return Err(LogStoreError::Publish("injected publish failure".into()));
        }

        let sequence = {
            let mut records = self.inner.records.write().await;
            let sequence = records.len() as u64 + 1;
            records.push(StoredRecord {
                subject: subject.to_string(),
                sequence,
                payload,
            });
            sequence
        };
        trace!(subject, sequence, "memory log append");
        self.inner.appended.notify_waiters();
        Ok(sequence)
    }

    async fn create_consumer(
        &self,
        filter: &str,
        policy: DeliverPolicy,
    ) -> LogStoreResult<Box<dyn LogConsumer>> {
        let next_sequence = match policy {
            DeliverPolicy::All => 1,
            DeliverPolicy::ByStartSequence(start) => start.max(1),
        };
        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            filter: filter.to_string(),
            next_sequence,
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    filter: String,
    next_sequence: u64,
}

impl MemoryConsumer {
    async fn collect(&self, max_count: usize) -> Vec<StoredRecord> {
        let records = self.inner.records.read().await;
        let start = usize::try_from(self.next_sequence.saturating_sub(1)).unwrap_or(usize::MAX);
        records
            .iter()
            .skip(start)
            .filter(|record| subject_matches(&self.filter, &record.subject))
            .take(max_count)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn fetch(&mut self, max_count: usize, max_wait: Duration) -> LogStoreResult<FetchBatch> {
        if MemoryLogStore::take_failure(&self.inner.failing_fetches) {
            return Ok(FetchBatch {
                records: Vec::new(),
                terminal_error: Some(LogStoreError::Fetch("injected fetch failure".into())),
            });
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let records = self.collect(max_count).await;
            if records.len() >= max_count || Instant::now() >= deadline {
                if let Some(last) = records.last() {
                    self.next_sequence = last.sequence + 1;
                }
                return Ok(FetchBatch {
                    records,
                    terminal_error: None,
                });
            }

            // Wake on the next append or when the wait budget runs out.
            let _ = tokio::time::timeout_at(deadline, appended).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn sequences_are_store_wide_and_increasing() {
        let store = MemoryLogStore::new();
        let a = store.publish("conv.t.a.msg.user", b"1".to_vec()).await.unwrap();
        let b = store.publish("conv.t.b.msg.user", b"2".to_vec()).await.unwrap();
        let c = store.publish("conv.t.a.msg.assistant", b"3".to_vec()).await.unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test]
    async fn consumer_filters_and_resumes_from_start_sequence() {
        let store = MemoryLogStore::new();
        for subject in [
            "conv.t.a.msg.user",
            "conv.t.b.msg.user",
            "conv.t.a.event.error",
            "conv.t.a.msg.assistant",
        ] {
            store.publish(subject, b"{}".to_vec()).await.unwrap();
        }

        let mut all = store
            .create_consumer("conv.t.a.msg.>", DeliverPolicy::All)
            .await
            .unwrap();
        let batch = all.fetch(10, WAIT).await.unwrap();
        let sequences: Vec<_> = batch.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [1, 4]);

        let mut tail = store
            .create_consumer("conv.t.a.msg.>", DeliverPolicy::ByStartSequence(2))
            .await
            .unwrap();
        let batch = tail.fetch(10, WAIT).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].sequence, 4);
    }

    #[tokio::test]
    async fn fetch_returns_full_batch_without_waiting_and_advances() {
        let store = MemoryLogStore::new();
        for _ in 0..3 {
            store.publish("conv.t.a.msg.user", b"{}".to_vec()).await.unwrap();
        }
        let mut consumer = store
            .create_consumer("conv.t.a.msg.>", DeliverPolicy::All)
            .await
            .unwrap();

        let first = consumer.fetch(2, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let second = consumer.fetch(2, WAIT).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].sequence, 3);
    }

    #[tokio::test]
    async fn fetch_wakes_when_a_record_arrives() {
        let store = MemoryLogStore::new();
        let mut consumer = store
            .create_consumer("conv.t.a.msg.>", DeliverPolicy::All)
            .await
            .unwrap();

        let publisher = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .publish("conv.t.a.msg.user", b"{}".to_vec())
                .await
                .unwrap();
        });

        let batch = consumer.fetch(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.records.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let store = MemoryLogStore::new();
        store.fail_next_publishes(1);
        assert!(store.publish("conv.t.a.msg.user", vec![]).await.is_err());
        assert_eq!(store.publish("conv.t.a.msg.user", vec![]).await.unwrap(), 1);

        store.fail_next_fetches(1);
        let mut consumer = store
            .create_consumer("conv.>", DeliverPolicy::All)
            .await
            .unwrap();
        assert!(consumer.fetch(1, WAIT).await.unwrap().terminal_error.is_some());
        assert!(consumer.fetch(1, WAIT).await.unwrap().terminal_error.is_none());
    }
}
