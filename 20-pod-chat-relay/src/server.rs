use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::{Html, Response},
    routing::get,
};
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    error::SubscribeError,
    gateway::BrokerGateway,
    lifecycle::{RelaySettings, RelayState, WebSocketSink, serve_client},
    outbound::OutboundRelay,
    page,
    registry::ClientRegistry,
};

/// One pod's bridge between browser sockets and its topic.
pub struct ChatRelay<G: BrokerGateway> {
    listener: TcpListener,
    state: Arc<RelayState<G>>,
    outbound: OutboundRelay<G, WebSocketSink>,
}

impl<G: BrokerGateway> ChatRelay<G> {
    /// Attaches the outbound consumer before anything is served, so a broker
    /// that cannot be subscribed to fails startup.
    pub async fn bind(
        listener: TcpListener,
        gateway: G,
        settings: RelaySettings,
    ) -> Result<Self, SubscribeError> {
        let gateway = Arc::new(gateway);
        let registry = Arc::new(ClientRegistry::new(settings.write_timeout));
        let outbound = OutboundRelay::attach(
            Arc::clone(&gateway),
            Arc::clone(&registry),
            settings.identity.topic(),
            settings.retry,
        )
        .await?;

        let state = Arc::new(RelayState {
            gateway,
            registry,
            settings,
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            listener,
            state,
            outbound,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves or the outbound relay fails for good.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatRelay {
            listener,
            state,
            outbound,
        } = self;
        let token = state.shutdown.clone();

        let mut relay = tokio::spawn(outbound.run(token.clone()));
        let app = router(Arc::clone(&state));
        let server_token = token.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_token.cancelled_owned())
                .await
        });

        tokio::pin!(shutdown);
        let finished = select! {
            _ = &mut shutdown => None,
            result = &mut relay => Some(result),
        };

        info!("relay shutting down");
        token.cancel();
        let relay_result = match finished {
            Some(result) => result,
            None => relay.await,
        };

        server
            .await
            .context("http server task panicked")?
            .context("http server failed")?;
        let closed = state.registry.close_all().await;
        debug!(closed, "closed remaining clients");

        let stats = relay_result
            .context("outbound relay task panicked")?
            .context("outbound relay failed")?;
        info!(
            records = stats.records,
            deliveries = stats.deliveries,
            dropped_clients = stats.dropped_clients,
            "relay stopped"
        );

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router<G: BrokerGateway>(state: Arc<RelayState<G>>) -> Router {
    Router::new()
        .route("/", get(home::<G>))
        .route("/ws", get(upgrade::<G>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn home<G: BrokerGateway>(State(state): State<Arc<RelayState<G>>>) -> Html<String> {
    Html(page::render(&state.settings.identity))
}

async fn upgrade<G: BrokerGateway>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState<G>>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_client(socket, state))
}
