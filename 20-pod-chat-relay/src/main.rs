use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use pod_chat_relay::{
    cli::{BrokerKind, Cli},
    gateway::{BrokerGateway, KafkaGateway, MemoryBroker},
    lifecycle::RelaySettings,
    server::ChatRelay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = cli.settings();
    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;

    match cli.broker {
        BrokerKind::Memory => serve(listener, MemoryBroker::new(), settings).await,
        BrokerKind::Kafka => {
            let gateway = KafkaGateway::connect(cli.brokers.clone())
                .await
                .context("failed to connect to kafka")?;
            if !cli.skip_topic_creation {
                gateway
                    .ensure_topic(settings.identity.topic(), cli.topic_replication)
                    .await
                    .with_context(|| {
                        format!("failed to create topic '{}'", settings.identity.topic())
                    })?;
            }
            serve(listener, gateway, settings).await
        }
    }
}

async fn serve<G: BrokerGateway>(
    listener: TcpListener,
    gateway: G,
    settings: RelaySettings,
) -> Result<()> {
    let topic = settings.identity.topic().to_string();
    let pod = settings.identity.to_string();

    let relay = ChatRelay::bind(listener, gateway, settings)
        .await
        .with_context(|| format!("failed to subscribe to topic '{topic}'"))?;
    let addr = relay.local_addr()?;
    info!(pod = %pod, topic = %topic, addr = %addr, "relay listening");

    if let Err(err) = relay.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
