use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{StreamExt, stream};
use tokio::sync::broadcast;
use tracing::debug;

use super::{Ack, BrokerGateway, Publisher, StartOffset, Subscription, TopicRecord};
use crate::error::{PublishError, SubscribeError};

// Live consumers that fall further behind than this see a `Lagged` error.
const DEFAULT_LIVE_BUFFER: usize = 1024;

type PartitionKey = (String, i32);

/// Partitioned log kept entirely in memory.
///
/// Cloning shares the same partitions. Offsets start at zero and grow by one
/// per record, as in a fresh Kafka partition.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: Mutex<HashMap<PartitionKey, PartitionLog>>,
    live_buffer: usize,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
}

struct PartitionLog {
    records: Vec<Vec<u8>>,
    live: broadcast::Sender<PartitionEvent>,
}

#[derive(Debug, Clone)]
enum PartitionEvent {
    Record(TopicRecord),
    Interrupted,
}

impl PartitionLog {
    fn new(live_buffer: usize) -> Self {
        let (live, _) = broadcast::channel(live_buffer);
        Self {
            records: Vec::new(),
            live,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_live_buffer(DEFAULT_LIVE_BUFFER)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose live consumers lag once `capacity` records are unread.
    pub fn with_live_buffer(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: Mutex::new(HashMap::new()),
                live_buffer: capacity.max(1),
                fail_publish: AtomicBool::new(false),
                fail_subscribe: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every publish fail with [`PublishError::Unavailable`] until reset.
    pub fn set_publish_failure(&self, failing: bool) {
        self.inner.fail_publish.store(failing, Ordering::SeqCst);
    }

    /// Makes every new consumer fail to open until reset.
    pub fn set_subscribe_failure(&self, failing: bool) {
        self.inner.fail_subscribe.store(failing, Ordering::SeqCst);
    }

    /// Ends every live consumer of the partition with a stream error.
    pub fn interrupt_consumers(&self, topic: &str, partition: i32) {
        let partitions = self.partitions();
        if let Some(log) = partitions.get(&(topic.to_string(), partition)) {
            let _ = log.live.send(PartitionEvent::Interrupted);
        }
    }

    /// Copy of every payload committed to the partition, in offset order.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Vec<u8>> {
        self.partitions()
            .get(&(topic.to_string(), partition))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    fn append(&self, topic: &str, partition: i32, payload: &[u8]) -> Result<i64, PublishError> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable);
        }

        let mut partitions = self.partitions();
        let log = partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| PartitionLog::new(self.inner.live_buffer));

        let offset = log.records.len() as i64;
        log.records.push(payload.to_vec());
        // No receivers just means nobody is consuming yet.
        let _ = log.live.send(PartitionEvent::Record(TopicRecord {
            offset,
            payload: payload.to_vec(),
        }));

        Ok(offset)
    }

    fn partitions(&self) -> MutexGuard<'_, HashMap<PartitionKey, PartitionLog>> {
        // A panic while holding the lock cannot leave a log half-written.
        self.inner
            .partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryPublisher {
    broker: MemoryBroker,
    topic: String,
}

impl Publisher for MemoryPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: &[u8]) -> Result<Ack, PublishError> {
        let offset = self
            .broker
            .append(&self.topic, super::RELAY_PARTITION, payload)?;
        Ok(Ack {
            offset: Some(offset),
        })
    }
}

impl BrokerGateway for MemoryBroker {
    type Publisher = MemoryPublisher;

    async fn publisher(&self, topic: &str) -> Result<MemoryPublisher, PublishError> {
        Ok(MemoryPublisher {
            broker: self.clone(),
            topic: topic.to_string(),
        })
    }

    async fn open_consumer(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Subscription, SubscribeError> {
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SubscribeError::Open {
                topic: topic.to_string(),
                partition,
                source: "memory broker is refusing consumers".into(),
            });
        }

        // Snapshot and subscribe under one lock so no record is missed or repeated.
        let (first, backlog, receiver) = {
            let mut partitions = self.partitions();
            let log = partitions
                .entry((topic.to_string(), partition))
                .or_insert_with(|| PartitionLog::new(self.inner.live_buffer));

            let first = match start {
                StartOffset::Latest => log.records.len() as i64,
                StartOffset::At(from) => from.max(0),
            };
            let backlog: Vec<TopicRecord> = log
                .records
                .iter()
                .enumerate()
                .skip(first as usize)
                .map(|(offset, payload)| TopicRecord {
                    offset: offset as i64,
                    payload: payload.clone(),
                })
                .collect();
            (first, backlog, log.live.subscribe())
        };

        debug!(topic, partition, first, backlog = backlog.len(), "memory consumer attached");

        let live = stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Ok(PartitionEvent::Record(record)) => Some((Ok(record), Some(receiver))),
                Ok(PartitionEvent::Interrupted) => Some((
                    Err(SubscribeError::Stream("consumer interrupted".into())),
                    None,
                )),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    Some((Err(SubscribeError::Lagged(skipped)), None))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(Subscription {
            start: first,
            records: stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RELAY_PARTITION;

    #[tokio::test]
    async fn offsets_grow_per_record() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher("pod-a").await.expect("publisher");

        let first = publisher.publish(b"one").await.expect("first publish");
        let second = publisher.publish(b"two").await.expect("second publish");

        assert_eq!(first.offset, Some(0));
        assert_eq!(second.offset, Some(1));
        assert_eq!(
            broker.records("pod-a", RELAY_PARTITION),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[tokio::test]
    async fn latest_consumer_skips_history() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher("pod-a").await.expect("publisher");
        publisher.publish(b"before").await.expect("publish");

        let mut subscription = broker
            .open_consumer("pod-a", RELAY_PARTITION, StartOffset::Latest)
            .await
            .expect("consumer");
        assert_eq!(subscription.start, 1);
        publisher.publish(b"after").await.expect("publish");

        let record = subscription
            .records
            .next()
            .await
            .expect("record")
            .expect("ok record");
        assert_eq!(record.offset, 1);
        assert_eq!(record.payload, b"after");
    }

    #[tokio::test]
    async fn consumer_resumes_from_offset() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher("pod-a").await.expect("publisher");
        for payload in [b"a", b"b", b"c"] {
            publisher.publish(payload).await.expect("publish");
        }

        let subscription = broker
            .open_consumer("pod-a", RELAY_PARTITION, StartOffset::At(1))
            .await
            .expect("consumer");
        assert_eq!(subscription.start, 1);
        let replayed: Vec<i64> = subscription
            .records
            .take(2)
            .map(|record| record.expect("ok record").offset)
            .collect()
            .await;

        assert_eq!(replayed, vec![1, 2]);
    }

    #[tokio::test]
    async fn interruption_ends_the_stream_with_an_error() {
        let broker = MemoryBroker::new();
        let mut records = broker
            .open_consumer("pod-a", RELAY_PARTITION, StartOffset::Latest)
            .await
            .expect("consumer")
            .records;

        broker.interrupt_consumers("pod-a", RELAY_PARTITION);

        assert!(matches!(
            records.next().await,
            Some(Err(SubscribeError::Stream(_)))
        ));
        assert!(records.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher("pod-a").await.expect("publisher");

        broker.set_publish_failure(true);
        assert!(matches!(
            publisher.publish(b"lost").await,
            Err(PublishError::Unavailable)
        ));
        broker.set_publish_failure(false);
        assert!(publisher.publish(b"kept").await.is_ok());

        broker.set_subscribe_failure(true);
        assert!(matches!(
            broker
                .open_consumer("pod-a", RELAY_PARTITION, StartOffset::Latest)
                .await,
            Err(SubscribeError::Open { .. })
        ));
    }
}
