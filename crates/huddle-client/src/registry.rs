//! Index of the consumers this session holds, keyed by remote producer id

use huddle_media::{Consumer, RecvTransport};
use huddle_protocol::{ConsumerId, MediaKind, ProducerId, TransportId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Local resources held for one remote producer
#[derive(Clone)]
pub struct ConsumerRecord {
    pub receive_transport: Arc<dyn RecvTransport>,
    pub server_transport_id: TransportId,
    pub remote_producer_id: ProducerId,
    pub consumer: Arc<dyn Consumer>,
}

impl ConsumerRecord {
    /// Close the consumer, then its transport
    pub async fn release(&self) {
        self.consumer.close().await;
        self.receive_transport.close().await;
    }

    pub fn summary(&self) -> ConsumerSummary {
        ConsumerSummary {
            remote_producer_id: self.remote_producer_id.clone(),
            server_transport_id: self.server_transport_id.clone(),
            consumer_id: self.consumer.id().to_string(),
            kind: self.consumer.kind(),
        }
    }
}

impl fmt::Debug for ConsumerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRecord")
            .field("remote_producer_id", &self.remote_producer_id)
            .field("server_transport_id", &self.server_transport_id)
            .field("consumer_id", &self.consumer.id())
            .finish()
    }
}

/// Read-only view handed to rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub remote_producer_id: ProducerId,
    pub server_transport_id: TransportId,
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
}

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    records: HashMap<ProducerId, ConsumerRecord>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. A record for an id already present is handed back.
    pub fn add(&mut self, record: ConsumerRecord) -> Result<(), ConsumerRecord> {
        if self.records.contains_key(&record.remote_producer_id) {
            return Err(record);
        }
        self.records
            .insert(record.remote_producer_id.clone(), record);
        Ok(())
    }

    pub fn find_by_producer_id(&self, remote_producer_id: &str) -> Option<&ConsumerRecord> {
        self.records.get(remote_producer_id)
    }

    /// Remove and return the record. The caller releases its resources.
    pub fn remove_by_producer_id(&mut self, remote_producer_id: &str) -> Option<ConsumerRecord> {
        self.records.remove(remote_producer_id)
    }

    pub fn contains(&self, remote_producer_id: &str) -> bool {
        self.records.contains_key(remote_producer_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        let mut ids: Vec<_> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<ConsumerSummary> {
        let mut summaries: Vec<_> = self.records.values().map(ConsumerRecord::summary).collect();
        summaries.sort_by(|a, b| a.remote_producer_id.cmp(&b.remote_producer_id));
        summaries
    }

    /// Empty the registry for teardown
    pub fn drain(&mut self) -> Vec<ConsumerRecord> {
        self.records.drain().map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use huddle_media::{ConsumeOptions, MediaStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTransport {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl RecvTransport for StubTransport {
        fn id(&self) -> &str {
            "t"
        }

        async fn connect(&self) -> huddle_media::Result<()> {
            Ok(())
        }

        async fn consume(&self, _options: ConsumeOptions) -> huddle_media::Result<Arc<dyn Consumer>> {
            Err(huddle_media::MediaError::Closed)
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubConsumer {
        id: String,
        producer_id: String,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Consumer for StubConsumer {
        fn id(&self) -> &str {
            &self.id
        }

        fn producer_id(&self) -> &str {
            &self.producer_id
        }

        fn kind(&self) -> MediaKind {
            MediaKind::Video
        }

        fn stream(&self) -> MediaStream {
            MediaStream::new(self.producer_id.clone(), MediaKind::Video).0
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(producer_id: &str) -> ConsumerRecord {
        ConsumerRecord {
            receive_transport: Arc::new(StubTransport {
                closed: AtomicUsize::new(0),
            }),
            server_transport_id: format!("t-{}", producer_id),
            remote_producer_id: producer_id.to_string(),
            consumer: Arc::new(StubConsumer {
                id: format!("c-{}", producer_id),
                producer_id: producer_id.to_string(),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    #[test]
    fn test_add_rejects_duplicate_producer() {
        let mut registry = ConsumerRegistry::new();
        assert!(registry.add(record("A")).is_ok());

        let rejected = registry.add(record("A")).unwrap_err();
        assert_eq!(rejected.remote_producer_id, "A");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let mut registry = ConsumerRegistry::new();
        registry.add(record("A")).unwrap();

        assert!(registry.remove_by_producer_id("B").is_none());
        assert!(registry.contains("A"));

        let removed = registry.remove_by_producer_id("A").unwrap();
        assert_eq!(removed.server_transport_id, "t-A");
        assert!(registry.is_empty());
        assert!(registry.find_by_producer_id("A").is_none());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut registry = ConsumerRegistry::new();
        registry.add(record("B")).unwrap();
        registry.add(record("A")).unwrap();

        assert_eq!(registry.producer_ids(), vec!["A", "B"]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].consumer_id, "c-A");
        assert_eq!(snapshot[1].server_transport_id, "t-B");
    }

    #[tokio::test]
    async fn test_release_closes_consumer_and_transport() {
        let consumer = Arc::new(StubConsumer {
            id: "c".to_string(),
            producer_id: "A".to_string(),
            closed: AtomicUsize::new(0),
        });
        let transport = Arc::new(StubTransport {
            closed: AtomicUsize::new(0),
        });
        let record = ConsumerRecord {
            receive_transport: transport.clone(),
            server_transport_id: "t".to_string(),
            remote_producer_id: "A".to_string(),
            consumer: consumer.clone(),
        };

        let mut registry = ConsumerRegistry::new();
        registry.add(record).unwrap();
        for record in registry.drain() {
            record.release().await;
        }

        assert!(registry.is_empty());
        assert_eq!(consumer.closed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }
}
