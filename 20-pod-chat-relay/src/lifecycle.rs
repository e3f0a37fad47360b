use std::{future, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ReadError, WriteError},
    gateway::BrokerGateway,
    identity::PodIdentity,
    inbound::InboundRelay,
    message::ClientFrame,
    outbound::RetryPolicy,
    registry::{ClientRegistry, ClientSink},
};

/// Runtime settings shared by every connection.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub identity: PodIdentity,
    pub write_timeout: Duration,
    pub notify_failures: bool,
    pub retry: RetryPolicy,
}

impl RelaySettings {
    pub fn new(identity: PodIdentity) -> Self {
        Self {
            identity,
            write_timeout: Duration::from_secs(5),
            notify_failures: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// State handed to every request handler.
pub struct RelayState<G> {
    pub gateway: Arc<G>,
    pub registry: Arc<ClientRegistry<WebSocketSink>>,
    pub settings: RelaySettings,
    pub shutdown: CancellationToken,
}

/// Write half of an upgraded browser socket.
pub struct WebSocketSink(SplitSink<WebSocket, Message>);

impl ClientSink for WebSocketSink {
    async fn send_text(&mut self, text: &str) -> Result<(), WriteError> {
        self.0
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|err| WriteError::Socket(Box::new(err)))
    }

    async fn close(&mut self) {
        if let Err(err) = SinkExt::close(&mut self.0).await {
            debug!(error = %err, "socket was already closed");
        }
    }
}

/// Reduces socket messages to the frames the inbound relay understands.
/// Control frames are answered by the socket itself and skipped here.
pub fn client_frames(
    messages: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<ClientFrame, ReadError>> + Send + Unpin {
    messages.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(ClientFrame::Text(text))),
            Ok(Message::Close(_)) => Some(Ok(ClientFrame::Close)),
            Ok(Message::Binary(_)) => Some(Err(ReadError::UnsupportedFrame("binary"))),
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(err) => Some(Err(ReadError::Socket(Box::new(err)))),
        })
    })
}

/// Drives one upgraded socket from registration to teardown.
///
/// The publisher is opened before the client is registered, so a client is
/// never visible to broadcasts without a way to publish. The inbound relay
/// unregisters and closes the client when it ends, and the publisher is
/// released with it.
pub async fn serve_client<G: BrokerGateway>(socket: WebSocket, state: Arc<RelayState<G>>) {
    let topic = state.settings.identity.topic();
    let publisher = match state.gateway.publisher(topic).await {
        Ok(publisher) => publisher,
        Err(err) => {
            warn!(topic, error = %err, "refusing client without a publisher");
            if let Err(err) = socket.close().await {
                debug!(error = %err, "failed to close refused socket");
            }
            return;
        }
    };

    let (sink, messages) = socket.split();
    let client = state.registry.next_id();
    state.registry.add(client, WebSocketSink(sink)).await;
    info!(client, topic, "client connected");

    let summary = InboundRelay::new(client, publisher, Arc::clone(&state.registry))
        .notify_failures(state.settings.notify_failures)
        .run(client_frames(messages), state.shutdown.child_token())
        .await;
    debug!(client, end = ?summary.end, "client session finished");
}
