use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::SubscribeError,
    gateway::{BrokerGateway, RELAY_PARTITION, RecordStream, StartOffset},
    registry::{ClientRegistry, ClientSink},
};

/// How the outbound relay reconnects after its subscription fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutboundStats {
    pub records: u64,
    pub deliveries: u64,
    pub dropped_clients: u64,
    pub reconnects: u64,
}

/// The single consumer of the pod topic, fanning every record out to all
/// registered clients.
pub struct OutboundRelay<G, S> {
    gateway: Arc<G>,
    registry: Arc<ClientRegistry<S>>,
    topic: String,
    retry: RetryPolicy,
    records: RecordStream,
    next_offset: i64,
    stats: OutboundStats,
}

impl<G, S> OutboundRelay<G, S>
where
    G: BrokerGateway,
    S: ClientSink,
{
    /// Attaches a consumer at the newest offset of the topic. Records
    /// committed before this returns are never delivered.
    pub async fn attach(
        gateway: Arc<G>,
        registry: Arc<ClientRegistry<S>>,
        topic: &str,
        retry: RetryPolicy,
    ) -> Result<Self, SubscribeError> {
        let subscription = gateway
            .open_consumer(topic, RELAY_PARTITION, StartOffset::Latest)
            .await?;
        info!(
            topic,
            partition = RELAY_PARTITION,
            offset = subscription.start,
            "outbound relay attached"
        );

        Ok(Self {
            gateway,
            registry,
            topic: topic.to_string(),
            retry,
            records: subscription.records,
            next_offset: subscription.start,
            stats: OutboundStats::default(),
        })
    }

    /// Delivers records until `shutdown` fires. Returns an error only when
    /// the subscription cannot be re-established within the retry policy.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
    ) -> Result<OutboundStats, SubscribeError> {
        let mut failures = 0;

        loop {
            let next = select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.records.next() => next,
            };

            let err = match next {
                Some(Ok(record)) => {
                    failures = 0;
                    self.next_offset = record.offset + 1;
                    self.stats.records += 1;

                    let report = self.registry.broadcast(&record.text()).await;
                    self.stats.deliveries += report.delivered as u64;
                    self.stats.dropped_clients += report.dropped.len() as u64;
                    debug!(
                        offset = record.offset,
                        delivered = report.delivered,
                        dropped = report.dropped.len(),
                        "broadcast record"
                    );
                    continue;
                }
                Some(Err(err)) => err,
                None => SubscribeError::Ended,
            };

            failures += 1;
            if !self.reconnect(err, &mut failures, &shutdown).await? {
                break;
            }
        }

        info!(
            topic = %self.topic,
            records = self.stats.records,
            reconnects = self.stats.reconnects,
            "outbound relay stopped"
        );
        Ok(self.stats)
    }

    /// Reopens the subscription at the first record not yet delivered, which
    /// is the attachment offset if nothing was delivered yet.
    /// Returns `Ok(false)` if shutdown fired while waiting.
    async fn reconnect(
        &mut self,
        mut err: SubscribeError,
        failures: &mut u32,
        shutdown: &CancellationToken,
    ) -> Result<bool, SubscribeError> {
        loop {
            if *failures > self.retry.max_attempts {
                return Err(SubscribeError::RetriesExhausted {
                    attempts: *failures - 1,
                    last: Box::new(err),
                });
            }

            let delay = self.retry.backoff(*failures);
            warn!(
                topic = %self.topic,
                error = %err,
                attempt = *failures,
                ?delay,
                "subscription failed, reconnecting"
            );
            select! {
                biased;
                _ = shutdown.cancelled() => return Ok(false),
                _ = time::sleep(delay) => {}
            }

            let start = StartOffset::At(self.next_offset);
            match self
                .gateway
                .open_consumer(&self.topic, RELAY_PARTITION, start)
                .await
            {
                Ok(subscription) => {
                    info!(topic = %self.topic, ?start, "subscription re-established");
                    self.records = subscription.records;
                    self.stats.reconnects += 1;
                    return Ok(true);
                }
                Err(open_err) => {
                    *failures += 1;
                    err = open_err;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }
}
