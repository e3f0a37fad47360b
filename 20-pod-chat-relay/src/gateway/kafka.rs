use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use futures::StreamExt;
use rskafka::{
    client::{
        Client, ClientBuilder,
        consumer::{StartOffset as KafkaStartOffset, StreamConsumerBuilder},
        error::{Error as KafkaError, ProtocolError},
        partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling},
    },
    record::Record,
};
use tracing::{debug, info};

use super::{
    Ack, BrokerGateway, Publisher, RELAY_PARTITION, StartOffset, Subscription, TopicRecord,
};
use crate::error::{PublishError, SubscribeError};

// Upper bound a fetch waits on the broker before returning an empty batch.
const MAX_WAIT_MS: i32 = 500;
const CREATE_TOPIC_TIMEOUT_MS: i32 = 5_000;

/// Gateway backed by a Kafka cluster.
///
/// One client (and its broker connections) is shared by the whole process;
/// every publisher and consumer gets its own partition client on top of it.
pub struct KafkaGateway {
    client: Arc<Client>,
}

impl KafkaGateway {
    pub async fn connect(brokers: Vec<String>) -> Result<Self, KafkaError> {
        info!(?brokers, "connecting to kafka");
        let client = ClientBuilder::new(brokers).build().await?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Creates the single-partition topic the relay uses. An existing topic
    /// is left as it is.
    pub async fn ensure_topic(&self, topic: &str, replication: i16) -> Result<(), KafkaError> {
        let controller = self.client.controller_client()?;
        match controller
            .create_topic(topic, 1, replication, CREATE_TOPIC_TIMEOUT_MS)
            .await
        {
            Ok(()) => {
                info!(topic, replication, "created topic");
                Ok(())
            }
            Err(KafkaError::ServerError {
                protocol_error: ProtocolError::TopicAlreadyExists,
                ..
            }) => {
                debug!(topic, "topic already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn partition_client(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<PartitionClient, KafkaError> {
        self.client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Error)
            .await
    }
}

pub struct KafkaPublisher {
    topic: String,
    partition: PartitionClient,
}

impl Publisher for KafkaPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: &[u8]) -> Result<Ack, PublishError> {
        let record = Record {
            key: None,
            value: Some(payload.to_vec()),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };

        let offsets = self
            .partition
            .produce(vec![record], Compression::NoCompression)
            .await
            .map_err(|err| PublishError::Broker(Box::new(err)))?;

        Ok(Ack {
            offset: offsets.first().copied(),
        })
    }
}

impl BrokerGateway for KafkaGateway {
    type Publisher = KafkaPublisher;

    async fn publisher(&self, topic: &str) -> Result<KafkaPublisher, PublishError> {
        let partition = self
            .partition_client(topic, RELAY_PARTITION)
            .await
            .map_err(|err| PublishError::Open {
                topic: topic.to_string(),
                source: Box::new(err),
            })?;

        Ok(KafkaPublisher {
            topic: topic.to_string(),
            partition,
        })
    }

    async fn open_consumer(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Subscription, SubscribeError> {
        let open_error = |err: KafkaError| SubscribeError::Open {
            topic: topic.to_string(),
            partition,
            source: Box::new(err),
        };

        let client = self
            .partition_client(topic, partition)
            .await
            .map_err(open_error)?;

        // Resolve "latest" now so the consumer is attached once this returns.
        let offset = match start {
            StartOffset::Latest => client.get_offset(OffsetAt::Latest).await.map_err(open_error)?,
            StartOffset::At(offset) => offset,
        };
        debug!(topic, partition, offset, "kafka consumer attached");

        let records = StreamConsumerBuilder::new(Arc::new(client), KafkaStartOffset::At(offset))
            .with_max_wait_ms(MAX_WAIT_MS)
            .build()
            .map(|item| {
                item.map(|(record, _high_watermark)| TopicRecord {
                    offset: record.offset,
                    payload: record.record.value.unwrap_or_default(),
                })
                .map_err(|err| SubscribeError::Stream(Box::new(err)))
            });

        Ok(Subscription {
            start: offset,
            records: records.boxed(),
        })
    }
}
