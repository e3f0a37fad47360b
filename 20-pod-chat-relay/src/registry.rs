use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures::future::join_all;
use tokio::{sync::Mutex, time};
use tracing::{debug, warn};

use crate::error::WriteError;

pub type ClientId = u64;

/// Write half of one client connection.
pub trait ClientSink: Send + 'static {
    fn send_text(&mut self, text: &str) -> impl Future<Output = Result<(), WriteError>> + Send;

    /// Closes the connection. Errors are not interesting at this point.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ClientId>,
}

/// Connections that are currently believed open.
///
/// Every operation takes the same lock, so a broadcast never sees a client
/// half added or half removed. Writes run concurrently while the lock is
/// held and each one is bounded by the write timeout.
pub struct ClientRegistry<S> {
    clients: Mutex<HashMap<ClientId, S>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl<S: ClientSink> ClientRegistry<S> {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    pub fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a connection. Adding an id again replaces its sink.
    pub async fn add(&self, id: ClientId, sink: S) {
        let mut clients = self.clients.lock().await;
        if clients.insert(id, sink).is_some() {
            debug!(client = id, "replaced existing registration");
        }
    }

    /// Unregisters a connection, handing back its sink. Unknown ids are a no-op.
    pub async fn remove(&self, id: ClientId) -> Option<S> {
        let mut clients = self.clients.lock().await;
        clients.remove(&id)
    }

    /// Unregisters and closes a connection. Returns whether it was registered.
    pub async fn remove_and_close(&self, id: ClientId) -> bool {
        let removed = self.clients.lock().await.remove(&id);
        match removed {
            Some(sink) => {
                self.close_detached(id, sink).await;
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: ClientId) -> bool {
        self.clients.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Registered ids in ascending order.
    pub async fn ids(&self) -> Vec<ClientId> {
        let clients = self.clients.lock().await;
        let mut ids: Vec<ClientId> = clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Visits every registered connection while holding the lock.
    pub async fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(ClientId, &mut S),
    {
        let mut clients = self.clients.lock().await;
        for (id, sink) in clients.iter_mut() {
            visit(*id, sink);
        }
    }

    /// Writes `text` to every registered connection. Connections whose write
    /// fails or times out are removed and closed; the rest are unaffected.
    ///
    /// Dropped connections are closed after the lock is released.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut detached = Vec::new();
        {
            let mut clients = self.clients.lock().await;
            if clients.is_empty() {
                return report;
            }

            let write_timeout = self.write_timeout;
            let results = join_all(clients.iter_mut().map(|(id, sink)| async move {
                (*id, bounded_write(sink, text, write_timeout).await)
            }))
            .await;

            for (id, result) in results {
                match result {
                    Ok(()) => report.delivered += 1,
                    Err(err) => {
                        warn!(client = id, error = %err, "dropping client after failed write");
                        if let Some(sink) = clients.remove(&id) {
                            detached.push((id, sink));
                        }
                        report.dropped.push(id);
                    }
                }
            }
        }

        join_all(
            detached
                .into_iter()
                .map(|(id, sink)| self.close_detached(id, sink)),
        )
        .await;
        report
    }

    /// Writes `text` to one connection, dropping it if the write fails.
    pub async fn send_to(&self, id: ClientId, text: &str) -> Result<(), WriteError> {
        let (result, detached) = {
            let mut clients = self.clients.lock().await;
            let sink = clients.get_mut(&id).ok_or(WriteError::NotRegistered)?;

            let result = bounded_write(sink, text, self.write_timeout).await;
            let detached = match result {
                Ok(()) => None,
                Err(_) => clients.remove(&id),
            };
            (result, detached)
        };

        if let Some(sink) = detached {
            self.close_detached(id, sink).await;
        }
        result
    }

    /// Unregisters and closes every connection.
    pub async fn close_all(&self) -> usize {
        let detached: Vec<(ClientId, S)> = self.clients.lock().await.drain().collect();
        let count = detached.len();
        join_all(
            detached
                .into_iter()
                .map(|(id, sink)| self.close_detached(id, sink)),
        )
        .await;
        count
    }

    /// Closes a sink that is no longer registered. A peer that stopped
    /// reading gets the write timeout to acknowledge, then is abandoned.
    async fn close_detached(&self, id: ClientId, mut sink: S) {
        if time::timeout(self.write_timeout, sink.close()).await.is_err() {
            debug!(client = id, "gave up closing unresponsive client");
        }
    }
}

async fn bounded_write<S: ClientSink>(
    sink: &mut S,
    text: &str,
    write_timeout: Duration,
) -> Result<(), WriteError> {
    match time::timeout(write_timeout, sink.send_text(text)).await {
        Ok(result) => result,
        Err(_) => Err(WriteError::TimedOut(write_timeout)),
    }
}
