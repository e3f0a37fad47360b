//! Narrow adapter over the partitioned log the relay publishes to and
//! consumes from.
//!
//! - [`kafka`] talks to a Kafka cluster through `rskafka`.
//! - [`memory`] keeps partitions in process, for local runs and tests.

use std::{borrow::Cow, future::Future};

use futures::stream::BoxStream;

use crate::error::{PublishError, SubscribeError};

pub mod kafka;
pub mod memory;

pub use kafka::KafkaGateway;
pub use memory::MemoryBroker;

/// The relay only ever uses the first partition of its topic.
pub const RELAY_PARTITION: i32 = 0;

/// Where a new consumer begins reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Only records committed after the consumer attaches.
    Latest,
    /// Resume at a known offset.
    At(i64),
}

/// A record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRecord {
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl TopicRecord {
    /// Payload as frame text. Bytes that are not UTF-8 are replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Broker acknowledgement for one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub offset: Option<i64>,
}

/// Infinite, non-restartable sequence of records in partition order.
pub type RecordStream = BoxStream<'static, Result<TopicRecord, SubscribeError>>;

/// An open consumer together with the offset of the first record it yields.
pub struct Subscription {
    pub start: i64,
    pub records: RecordStream,
}

/// A publishing handle bound to one topic and [`RELAY_PARTITION`].
pub trait Publisher: Send + Sync + 'static {
    fn topic(&self) -> &str;

    fn publish(&self, payload: &[u8]) -> impl Future<Output = Result<Ack, PublishError>> + Send;
}

pub trait BrokerGateway: Send + Sync + 'static {
    type Publisher: Publisher;

    /// Opens a publisher owned by a single caller; dropping it releases it.
    fn publisher(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Self::Publisher, PublishError>> + Send;

    fn open_consumer(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> impl Future<Output = Result<Subscription, SubscribeError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_text_replaces_invalid_utf8() {
        let record = TopicRecord {
            offset: 0,
            payload: vec![b'h', b'i', 0xff],
        };
        assert_eq!(record.text(), "hi\u{fffd}");
    }
}
