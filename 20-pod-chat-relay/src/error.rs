use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reading from a client socket. Always local to that client.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("socket read failed: {0}")]
    Socket(#[source] BoxError),
    #[error("unsupported {0} frame")]
    UnsupportedFrame(&'static str),
}

/// Failure writing to a client socket. Always local to that client.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("socket write failed: {0}")]
    Socket(#[source] BoxError),
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
    #[error("client is no longer registered")]
    NotRegistered,
}

/// The broker could not accept a message.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to open publisher for topic '{topic}': {source}")]
    Open {
        topic: String,
        #[source]
        source: BoxError,
    },
    #[error("broker rejected message: {0}")]
    Broker(#[source] BoxError),
    #[error("broker is unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("failed to open consumer on {topic}/{partition}: {source}")]
    Open {
        topic: String,
        partition: i32,
        #[source]
        source: BoxError,
    },
    #[error("subscription failed: {0}")]
    Stream(#[source] BoxError),
    #[error("consumer fell behind by {0} records")]
    Lagged(u64),
    #[error("subscription ended")]
    Ended,
    #[error("giving up on subscription after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SubscribeError>,
    },
}
