use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{
    identity::{POD_NAME_ENV, PodIdentity},
    lifecycle::RelaySettings,
    outbound::RetryPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the HTTP server binds to. Use port 0 for an ephemeral port.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Name of this pod. It is shown on the chat page and names the topic.
    #[arg(long, env = POD_NAME_ENV)]
    pub pod_name: Option<String>,

    /// Log the relay publishes to and consumes from.
    #[arg(long, env = "RELAY_BROKER", value_enum, default_value_t = BrokerKind::Kafka)]
    pub broker: BrokerKind,

    /// Kafka bootstrap servers, comma separated.
    #[arg(long, env = "KAFKA_BROKERS", value_delimiter = ',', default_value = "kafka:9092")]
    pub brokers: Vec<String>,

    /// Longest a single write to a client may take before it is dropped.
    #[arg(long, env = "WRITE_TIMEOUT_MS", default_value_t = 5_000)]
    pub write_timeout_ms: u64,

    /// Consecutive subscription failures tolerated before the relay exits.
    #[arg(long, env = "CONSUMER_RETRIES", default_value_t = 5)]
    pub consumer_retries: u32,

    /// Delay before the first reconnect; doubles on each further attempt.
    #[arg(long, env = "CONSUMER_BACKOFF_MS", default_value_t = 250)]
    pub consumer_backoff_ms: u64,

    /// Do not tell clients when one of their messages could not be published.
    #[arg(long, env = "NO_FAILURE_NOTICE")]
    pub no_failure_notice: bool,

    /// Assume the topic already exists instead of creating it at startup.
    #[arg(long, env = "SKIP_TOPIC_CREATION")]
    pub skip_topic_creation: bool,

    /// Replication factor used when the topic is created.
    #[arg(long, env = "TOPIC_REPLICATION", default_value_t = 1)]
    pub topic_replication: i16,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// A Kafka cluster reached through `--brokers`.
    Kafka,
    /// An in-process log; records only reach clients of this process.
    Memory,
}

impl Cli {
    pub fn settings(&self) -> RelaySettings {
        let retry = RetryPolicy {
            max_attempts: self.consumer_retries,
            initial_backoff: Duration::from_millis(self.consumer_backoff_ms),
            ..RetryPolicy::default()
        };

        RelaySettings {
            identity: PodIdentity::resolve(self.pod_name.as_deref()),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            notify_failures: !self.no_failure_notice,
            retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UNKNOWN_POD_NAME;

    #[test]
    fn settings_follow_flags() {
        let cli = Cli::try_parse_from([
            "pod_chat_relay",
            "--pod-name",
            "chat-1",
            "--broker",
            "memory",
            "--write-timeout-ms",
            "750",
            "--consumer-retries",
            "2",
            "--no-failure-notice",
        ])
        .expect("valid arguments");
        let settings = cli.settings();

        assert_eq!(cli.broker, BrokerKind::Memory);
        assert_eq!(settings.identity.topic(), "chat-1");
        assert_eq!(settings.write_timeout, Duration::from_millis(750));
        assert_eq!(settings.retry.max_attempts, 2);
        assert!(!settings.notify_failures);
    }

    #[test]
    fn brokers_are_comma_separated() {
        let cli = Cli::try_parse_from(["pod_chat_relay", "--brokers", "k1:9092,k2:9092"])
            .expect("valid arguments");
        assert_eq!(cli.brokers, vec!["k1:9092".to_string(), "k2:9092".to_string()]);
    }

    #[test]
    fn empty_pod_name_falls_back_to_sentinel() {
        let cli =
            Cli::try_parse_from(["pod_chat_relay", "--pod-name", ""]).expect("valid arguments");
        assert_eq!(cli.settings().identity.name(), UNKNOWN_POD_NAME);
    }
}
