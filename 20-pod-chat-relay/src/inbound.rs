use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{PublishError, ReadError},
    gateway::Publisher,
    message::{ClientFrame, RelayMessage},
    registry::{ClientId, ClientRegistry, ClientSink},
};

/// Why a client session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client closed the socket or the stream ended.
    Closed,
    ReadFailed(ReadError),
    Shutdown,
}

#[derive(Debug)]
pub struct SessionSummary {
    pub published: u64,
    pub failed: u64,
    pub end: SessionEnd,
}

/// Reads one client's frames and publishes them to the pod topic.
///
/// The relay owns the publisher for its whole life. Whatever ends the
/// session, the client is unregistered and its connection closed before
/// [`InboundRelay::run`] returns.
pub struct InboundRelay<P, S> {
    client: ClientId,
    publisher: P,
    registry: Arc<ClientRegistry<S>>,
    notify_failures: bool,
}

impl<P, S> InboundRelay<P, S>
where
    P: Publisher,
    S: ClientSink,
{
    pub fn new(client: ClientId, publisher: P, registry: Arc<ClientRegistry<S>>) -> Self {
        Self {
            client,
            publisher,
            registry,
            notify_failures: true,
        }
    }

    /// Whether the client is told when one of its messages is not published.
    pub fn notify_failures(mut self, enabled: bool) -> Self {
        self.notify_failures = enabled;
        self
    }

    pub async fn run<F>(self, frames: F, shutdown: CancellationToken) -> SessionSummary
    where
        F: Stream<Item = Result<ClientFrame, ReadError>> + Unpin,
    {
        let mut frames = frames;
        let mut published = 0;
        let mut failed = 0;

        let end = loop {
            let frame = select! {
                biased;
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(ClientFrame::Text(text))) => match self.relay(&text).await {
                    Ok(true) => published += 1,
                    Ok(false) => {}
                    Err(err) => {
                        failed += 1;
                        self.report_failure(&err).await;
                    }
                },
                Some(Ok(ClientFrame::Close)) | None => break SessionEnd::Closed,
                Some(Err(err)) => break SessionEnd::ReadFailed(err),
            }
        };

        match &end {
            SessionEnd::ReadFailed(err) => {
                warn!(client = self.client, error = %err, "client read failed")
            }
            SessionEnd::Closed => debug!(client = self.client, "client closed connection"),
            SessionEnd::Shutdown => debug!(client = self.client, "closing client for shutdown"),
        }
        self.registry.remove_and_close(self.client).await;
        info!(client = self.client, published, failed, "client disconnected");

        SessionSummary {
            published,
            failed,
            end,
        }
    }

    /// Publishes one message; `Ok(false)` when it normalized to nothing.
    async fn relay(&self, text: &str) -> Result<bool, PublishError> {
        let message = RelayMessage::normalize(text);
        if message.is_empty() {
            debug!(client = self.client, "skipping empty message");
            return Ok(false);
        }

        let ack = self.publisher.publish(message.as_bytes()).await?;
        debug!(
            client = self.client,
            topic = self.publisher.topic(),
            offset = ?ack.offset,
            "published message"
        );
        Ok(true)
    }

    async fn report_failure(&self, err: &PublishError) {
        warn!(
            client = self.client,
            topic = self.publisher.topic(),
            error = %err,
            "failed to publish message"
        );
        if !self.notify_failures {
            return;
        }

        let notice = format!("*** message not delivered: {err}");
        if let Err(write_err) = self.registry.send_to(self.client, &notice).await {
            debug!(client = self.client, error = %write_err, "failed to send delivery notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{channel::mpsc, stream};

    use super::*;
    use crate::{
        gateway::{BrokerGateway, MemoryBroker, RELAY_PARTITION, memory::MemoryPublisher},
        testing::{RecordingSink, SinkLog},
    };

    const TOPIC: &str = "pod-a";

    async fn setup() -> (
        MemoryBroker,
        Arc<ClientRegistry<RecordingSink>>,
        InboundRelay<MemoryPublisher, RecordingSink>,
        SinkLog,
    ) {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ClientRegistry::new(Duration::from_millis(200)));
        let (sink, log) = RecordingSink::new();
        let id = registry.next_id();
        registry.add(id, sink).await;

        let publisher = broker.publisher(TOPIC).await.expect("publisher");
        let relay = InboundRelay::new(id, publisher, Arc::clone(&registry));
        (broker, registry, relay, log)
    }

    fn text(value: &str) -> Result<ClientFrame, ReadError> {
        Ok(ClientFrame::Text(value.to_string()))
    }

    #[tokio::test]
    async fn publishes_normalized_messages() {
        let (broker, registry, relay, log) = setup().await;
        let frames = stream::iter(vec![text("hello\nworld"), text("  \n "), text(" bye ")]);

        let summary = relay.run(frames, CancellationToken::new()).await;

        assert_eq!(summary.published, 2);
        assert!(matches!(summary.end, SessionEnd::Closed));
        assert_eq!(
            broker.records(TOPIC, RELAY_PARTITION),
            vec![b"hello world".to_vec(), b"bye".to_vec()]
        );
        assert!(registry.is_empty().await);
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn read_error_unregisters_and_closes() {
        let (_broker, registry, relay, log) = setup().await;
        let frames = stream::iter(vec![
            text("first"),
            Err(ReadError::UnsupportedFrame("binary")),
            text("never read"),
        ]);

        let summary = relay.run(frames, CancellationToken::new()).await;

        assert_eq!(summary.published, 1);
        assert!(matches!(
            summary.end,
            SessionEnd::ReadFailed(ReadError::UnsupportedFrame("binary"))
        ));
        assert!(registry.is_empty().await);
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn publish_failure_keeps_session_alive() {
        let (broker, registry, relay, log) = setup().await;
        let (tx, rx) = mpsc::unbounded();
        let session = tokio::spawn(relay.run(rx, CancellationToken::new()));

        broker.set_publish_failure(true);
        tx.unbounded_send(text("lost")).expect("send frame");
        let notices = log
            .wait_for(1, Duration::from_secs(1))
            .await
            .expect("delivery notice");
        assert!(notices[0].starts_with("*** message not delivered"));
        assert_eq!(registry.len().await, 1);

        broker.set_publish_failure(false);
        tx.unbounded_send(text("kept")).expect("send frame");
        drop(tx);

        let summary = session.await.expect("session task");
        assert_eq!(summary.published, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(broker.records(TOPIC, RELAY_PARTITION), vec![b"kept".to_vec()]);
    }

    #[tokio::test]
    async fn failure_notice_can_be_disabled() {
        let (broker, _registry, relay, log) = setup().await;
        broker.set_publish_failure(true);

        let summary = relay
            .notify_failures(false)
            .run(stream::iter(vec![text("lost")]), CancellationToken::new())
            .await;

        assert_eq!(summary.failed, 1);
        assert!(log.sent().is_empty());
    }

    #[tokio::test]
    async fn shutdown_ends_a_blocked_session() {
        let (_broker, registry, relay, log) = setup().await;
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(relay.run(
            stream::pending::<Result<ClientFrame, ReadError>>(),
            shutdown.clone(),
        ));

        shutdown.cancel();
        let summary = session.await.expect("session task");

        assert!(matches!(summary.end, SessionEnd::Shutdown));
        assert!(registry.is_empty().await);
        assert!(log.is_closed());
    }
}
