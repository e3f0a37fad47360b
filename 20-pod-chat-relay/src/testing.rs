//! In-memory client sinks for driving the relays without real sockets.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{sync::Notify, time};

use crate::{error::WriteError, registry::ClientSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Deliver,
    Fail,
    Stall,
}

#[derive(Debug)]
struct SinkState {
    sent: Vec<String>,
    closed: bool,
    mode: WriteMode,
    stall_close: bool,
}

/// Observer half of a [`RecordingSink`], kept by the test after the sink
/// itself moves into a registry.
#[derive(Clone)]
pub struct SinkLog {
    state: Arc<Mutex<SinkState>>,
    changed: Arc<Notify>,
}

impl SinkLog {
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Every later write fails as if the socket had been closed by the peer.
    pub fn fail_writes(&self) {
        self.state().mode = WriteMode::Fail;
    }

    /// Every later write never completes.
    pub fn stall_writes(&self) {
        self.state().mode = WriteMode::Stall;
    }

    /// Closing never completes, like a socket whose peer stopped reading.
    pub fn stall_close(&self) {
        self.state().stall_close = true;
    }

    /// Waits until at least `count` frames were written, returning them.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Option<Vec<String>> {
        let wait = async {
            loop {
                let changed = self.changed.notified();
                {
                    let state = self.state();
                    if state.sent.len() >= count {
                        return state.sent.clone();
                    }
                }
                changed.await;
            }
        };
        time::timeout(limit, wait).await.ok()
    }

    /// Waits until the sink has been closed.
    pub async fn wait_closed(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let changed = self.changed.notified();
                if self.is_closed() {
                    return;
                }
                changed.await;
            }
        };
        time::timeout(limit, wait).await.is_ok()
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sink that records every frame written to it.
pub struct RecordingSink {
    log: SinkLog,
}

impl RecordingSink {
    pub fn new() -> (Self, SinkLog) {
        let log = SinkLog {
            state: Arc::new(Mutex::new(SinkState {
                sent: Vec::new(),
                closed: false,
                mode: WriteMode::Deliver,
                stall_close: false,
            })),
            changed: Arc::new(Notify::new()),
        };
        (Self { log: log.clone() }, log)
    }
}

impl ClientSink for RecordingSink {
    async fn send_text(&mut self, text: &str) -> Result<(), WriteError> {
        let mode = self.log.state().mode;
        match mode {
            WriteMode::Deliver => {
                self.log.state().sent.push(text.to_string());
                self.log.changed.notify_waiters();
                Ok(())
            }
            WriteMode::Fail => Err(WriteError::Socket("simulated closed socket".into())),
            WriteMode::Stall => futures::future::pending().await,
        }
    }

    async fn close(&mut self) {
        let stall = self.log.state().stall_close;
        if stall {
            futures::future::pending::<()>().await;
        }
        self.log.state().closed = true;
        self.log.changed.notify_waiters();
    }
}
