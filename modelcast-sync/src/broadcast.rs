//! Outbound pump: the single task that writes frames to client queues.
//!
//! ```text
//!  model listener ─┐
//!  send_one ───────┼──▸ PumpCommand queue ──▸ pump task ──┬──▸ client A queue ──▸ socket
//!  new connection ─┘        (FIFO)           (one owner)  ├──▸ client B queue ──▸ socket
//!                                                         └──▸ client C queue ──▸ socket
//! ```
//!
//! Every frame to every client passes through the pump in command order, so
//! a unicast never overtakes a broadcast queued before it. A broadcast is
//! encoded once and fanned out with bounded concurrency. A client whose queue
//! stays full longer than the slow-client timeout is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};

/// A frame queued for one client's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Close,
}

/// Identity of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: String,
    pub remote_ip: String,
    /// Epoch milliseconds
    pub connected_at: u64,
}

/// The pump's handle on one client queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub info: ClientInfo,
    sender: mpsc::Sender<Outbound>,
    evicted: Arc<Notify>,
}

/// The socket writer's end of a client queue.
#[derive(Debug)]
pub struct ClientReceiver {
    rx: mpsc::Receiver<Outbound>,
    evicted: Arc<Notify>,
}

impl ClientReceiver {
    /// Next frame to write. Eviction turns into [`Outbound::Close`].
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            _ = self.evicted.notified() => Some(Outbound::Close),
            frame = self.rx.recv() => frame,
        }
    }
}

/// Create a bounded queue for a new client.
pub fn client_channel(info: ClientInfo, capacity: usize) -> (ClientHandle, ClientReceiver) {
    let (sender, rx) = mpsc::channel(capacity.max(1));
    let evicted = Arc::new(Notify::new());
    (
        ClientHandle {
            info,
            sender,
            evicted: Arc::clone(&evicted),
        },
        ClientReceiver { rx, evicted },
    )
}

/// Pump counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub unicasts: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub clients_evicted: u64,
    pub active_clients: usize,
}

#[derive(Default)]
struct AtomicPumpStats {
    broadcasts: AtomicU64,
    unicasts: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    clients_evicted: AtomicU64,
}

enum PumpCommand {
    Attach {
        handle: ClientHandle,
        refresh: Arc<str>,
        done: oneshot::Sender<()>,
    },
    Detach {
        client_id: String,
        done: oneshot::Sender<()>,
    },
    Broadcast(Arc<str>),
    Unicast {
        client_id: String,
        frame: Arc<str>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

type ClientTable = Arc<RwLock<HashMap<String, ClientHandle>>>;

/// Handle to the pump task. Cheap to clone.
#[derive(Clone)]
pub struct Pump {
    commands: mpsc::UnboundedSender<PumpCommand>,
    clients: ClientTable,
    stats: Arc<AtomicPumpStats>,
}

impl Pump {
    /// Spawn the pump task on the current runtime.
    pub fn spawn(broadcast_concurrency: usize, slow_client_timeout: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let clients: ClientTable = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(AtomicPumpStats::default());

        let worker = PumpWorker {
            clients: Arc::clone(&clients),
            stats: Arc::clone(&stats),
            concurrency: broadcast_concurrency.max(1),
            slow_client_timeout,
        };
        tokio::spawn(worker.run(rx));

        Self {
            commands,
            clients,
            stats,
        }
    }

    /// Register a client. `refresh` is its first frame.
    ///
    /// Enqueueing is synchronous so callers can do it under the model lock;
    /// the returned receiver completes once the client is in the table.
    pub fn attach(&self, handle: ClientHandle, refresh: Arc<str>) -> oneshot::Receiver<()> {
        let (done, ack) = oneshot::channel();
        self.submit(PumpCommand::Attach {
            handle,
            refresh,
            done,
        });
        ack
    }

    /// Remove a client and wait until the pump has dropped it.
    pub async fn detach(&self, client_id: &str) {
        let (done, ack) = oneshot::channel();
        self.submit(PumpCommand::Detach {
            client_id: client_id.to_string(),
            done,
        });
        let _ = ack.await;
    }

    /// Queue an encoded frame for every client.
    pub fn broadcast(&self, frame: Arc<str>) {
        self.submit(PumpCommand::Broadcast(frame));
    }

    /// Queue an encoded frame for one client.
    pub fn unicast(&self, client_id: &str, frame: Arc<str>) {
        self.submit(PumpCommand::Unicast {
            client_id: client_id.to_string(),
            frame,
        });
    }

    /// Close every client queue and stop the pump.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(PumpCommand::Shutdown { done }).is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn has_client(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let active_clients = self.clients.read().await.len();
        BroadcastStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            unicasts: self.stats.unicasts.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            clients_evicted: self.stats.clients_evicted.load(Ordering::Relaxed),
            active_clients,
        }
    }

    fn submit(&self, command: PumpCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("Pump stopped, outbound frame discarded");
        }
    }
}

struct PumpWorker {
    clients: ClientTable,
    stats: Arc<AtomicPumpStats>,
    concurrency: usize,
    slow_client_timeout: Duration,
}

enum Delivery {
    Sent,
    Closed,
    Lagging,
}

impl PumpWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PumpCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PumpCommand::Attach {
                    handle,
                    refresh,
                    done,
                } => {
                    let client_id = handle.info.client_id.clone();
                    self.clients
                        .write()
                        .await
                        .insert(client_id.clone(), handle.clone());
                    if !matches!(self.deliver(&handle, refresh).await, Delivery::Sent) {
                        log::warn!("Client {client_id} gone before its refresh was queued");
                        self.clients.write().await.remove(&client_id);
                    }
                    let _ = done.send(());
                }
                PumpCommand::Detach { client_id, done } => {
                    self.clients.write().await.remove(&client_id);
                    let _ = done.send(());
                }
                PumpCommand::Broadcast(frame) => {
                    self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
                    self.fan_out(frame).await;
                }
                PumpCommand::Unicast { client_id, frame } => {
                    self.stats.unicasts.fetch_add(1, Ordering::Relaxed);
                    let handle = self.clients.read().await.get(&client_id).cloned();
                    match handle {
                        Some(handle) => {
                            if let Delivery::Lagging = self.deliver(&handle, frame).await {
                                self.evict(&[handle]).await;
                            }
                        }
                        None => {
                            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping message for unknown client {client_id}");
                        }
                    }
                }
                PumpCommand::Shutdown { done } => {
                    let mut clients = self.clients.write().await;
                    for handle in clients.values() {
                        let _ = handle.sender.try_send(Outbound::Close);
                        handle.evicted.notify_one();
                    }
                    clients.clear();
                    let _ = done.send(());
                    break;
                }
            }
        }
        log::debug!("Outbound pump stopped");
    }

    async fn fan_out(&self, frame: Arc<str>) {
        let targets: Vec<ClientHandle> = self.clients.read().await.values().cloned().collect();
        if targets.is_empty() {
            return;
        }

        let lagging = Arc::new(std::sync::Mutex::new(Vec::new()));
        stream::iter(targets)
            .for_each_concurrent(self.concurrency, |handle| {
                let frame = Arc::clone(&frame);
                let lagging = Arc::clone(&lagging);
                async move {
                    if let Delivery::Lagging = self.deliver(&handle, frame).await {
                        lagging
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(handle);
                    }
                }
            })
            .await;

        let lagging = std::mem::take(&mut *lagging.lock().unwrap_or_else(|e| e.into_inner()));
        if !lagging.is_empty() {
            self.evict(&lagging).await;
        }
    }

    async fn deliver(&self, handle: &ClientHandle, frame: Arc<str>) -> Delivery {
        match handle
            .sender
            .send_timeout(Outbound::Text(frame), self.slow_client_timeout)
            .await
        {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Closed
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Lagging
            }
        }
    }

    async fn evict(&self, handles: &[ClientHandle]) {
        let mut clients = self.clients.write().await;
        for handle in handles {
            log::warn!(
                "Client {} could not keep up, disconnecting",
                handle.info.client_id
            );
            clients.remove(&handle.info.client_id);
            handle.evicted.notify_one();
            self.stats.clients_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }
}
