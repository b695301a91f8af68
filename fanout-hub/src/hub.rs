//! Client registry and broadcast coordinator.
//!
//! The [`Hub`] runs as a single task that owns the set of registered clients.
//! Nothing else touches that set: pumps talk to the hub through a cloneable
//! [`HubHandle`], which pushes commands onto one unbounded channel. Because
//! the dispatch loop is the only reader and writer of the registry, it needs
//! no lock, and because the channel is FIFO, every caller's commands are
//! applied in the order it sent them.
//!
//! Each registered client is represented by the sending half of its bounded
//! outbound queue. A broadcast attempts a non-blocking send to every queue; a
//! client whose queue is full is evicted on the spot, so one stalled peer can
//! never hold up delivery to everybody else.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::error::HubError;

/// Identity of one client connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Snapshot of the hub's registry and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStatus {
    /// Registered clients, in ascending id order.
    pub clients: Vec<ClientId>,
    /// Broadcasts processed since the hub started.
    pub broadcasts: u64,
    /// Clients removed because their outbound queue was full or closed.
    pub evictions: u64,
}

enum HubCommand {
    Register {
        id: ClientId,
        outbound: mpsc::Sender<Bytes>,
    },
    Unregister(ClientId),
    Broadcast(Bytes),
    Status {
        respond_to: oneshot::Sender<HubStatus>,
    },
    Shutdown,
}

/// Cheap, cloneable entry point to a running [`Hub`].
///
/// Sends never wait for the hub: the command channel is unbounded, so a pump
/// is never stalled by the coordinator. They fail only once the dispatch loop
/// has exited.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Admits a client. `outbound` becomes the hub's only sender into that
    /// client's queue; the queue closes when the hub drops it.
    pub fn register(&self, id: ClientId, outbound: mpsc::Sender<Bytes>) -> Result<(), HubError> {
        self.send(HubCommand::Register { id, outbound })
    }

    pub fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(id))
    }

    pub fn broadcast(&self, payload: Bytes) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast(payload))
    }

    /// Reports the registry once every command this handle sent earlier has
    /// been applied.
    pub async fn status(&self) -> Result<HubStatus, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::Status { respond_to })?;
        response.await.map_err(|_| HubError::Stopped)
    }

    /// Closes every client's outbound queue and stops the dispatch loop.
    pub fn shutdown(&self) -> Result<(), HubError> {
        self.send(HubCommand::Shutdown)
    }

    fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Stopped)
    }
}

/// The dispatch loop and the registry it owns.
pub struct Hub {
    clients: HashMap<ClientId, mpsc::Sender<Bytes>>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    broadcasts: u64,
    evictions: u64,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let hub = Self {
            clients: HashMap::new(),
            commands,
            broadcasts: 0,
            evictions: 0,
        };
        (hub, HubHandle { commands: commands_tx })
    }

    /// Starts the dispatch loop on the current runtime.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new();
        (handle, tokio::spawn(hub.run()))
    }

    /// Processes commands until [`HubHandle::shutdown`] is called or every
    /// handle has been dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if !self.handle_command(command) {
                break;
            }
        }

        let remaining = self.clients.len();
        self.clients.clear();
        info!(remaining, "hub stopped");
    }

    fn handle_command(&mut self, command: HubCommand) -> bool {
        match command {
            HubCommand::Register { id, outbound } => self.register(id, outbound),
            HubCommand::Unregister(id) => self.unregister(id),
            HubCommand::Broadcast(payload) => self.broadcast(payload),
            HubCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            HubCommand::Shutdown => return false,
        }
        true
    }

    fn register(&mut self, id: ClientId, outbound: mpsc::Sender<Bytes>) {
        match self.clients.entry(id) {
            Entry::Occupied(_) => debug!(client = %id, "client already registered"),
            Entry::Vacant(slot) => {
                slot.insert(outbound);
                debug!(client = %id, clients = self.clients.len(), "client registered");
            }
        }
    }

    fn unregister(&mut self, id: ClientId) {
        // Dropping the sender closes the queue and lets the write pump finish.
        if self.clients.remove(&id).is_some() {
            debug!(client = %id, clients = self.clients.len(), "client unregistered");
        }
    }

    fn broadcast(&mut self, payload: Bytes) {
        self.broadcasts += 1;
        let mut evicted = 0;

        self.clients
            .retain(|id, outbound| match outbound.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(client = %id, "outbound queue full, evicting slow client");
                    evicted += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, "outbound queue closed by its consumer");
                    evicted += 1;
                    false
                }
            });

        self.evictions += evicted;
    }

    fn status(&self) -> HubStatus {
        let mut clients: Vec<ClientId> = self.clients.keys().copied().collect();
        clients.sort_unstable();
        HubStatus {
            clients,
            broadcasts: self.broadcasts,
            evictions: self.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(capacity: usize) -> (ClientId, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ClientId::next(), tx, rx)
    }

    #[test]
    fn client_ids_are_unique_and_displayable() {
        let first = ClientId::next();
        let second = ClientId::next();
        assert_ne!(first, second);
        assert_eq!(first.to_string(), format!("client-{}", first.as_u64()));
    }

    #[tokio::test]
    async fn membership_is_registered_minus_unregistered() {
        let (hub, _task) = Hub::spawn();
        let mut ids = Vec::new();
        let mut queues = Vec::new();
        for _ in 0..6 {
            let (id, tx, rx) = client(4);
            hub.register(id, tx).expect("register");
            ids.push(id);
            queues.push(rx);
        }

        hub.unregister(ids[4]).expect("unregister");
        hub.unregister(ids[1]).expect("unregister");
        hub.unregister(ids[4]).expect("unregister twice");

        let status = hub.status().await.expect("status");
        assert_eq!(status.clients, vec![ids[0], ids[2], ids[3], ids[5]]);
        assert_eq!(status.evictions, 0);
    }

    #[tokio::test]
    async fn broadcast_enqueues_once_per_client() {
        let (hub, _task) = Hub::spawn();
        let mut queues = Vec::new();
        for _ in 0..3 {
            let (id, tx, rx) = client(4);
            hub.register(id, tx).expect("register");
            queues.push(rx);
        }

        hub.broadcast(Bytes::from_static(b"hello")).expect("broadcast");
        let status = hub.status().await.expect("status");
        assert_eq!(status.broadcasts, 1);

        for rx in &mut queues {
            assert_eq!(rx.recv().await, Some(Bytes::from_static(b"hello")));
            assert!(rx.try_recv().is_err(), "no duplicate delivery");
        }
    }

    #[tokio::test]
    async fn full_queue_evicts_client_and_closes_it() {
        let (hub, _task) = Hub::spawn();
        let (slow, slow_tx, mut slow_rx) = client(1);
        let (fast, fast_tx, mut fast_rx) = client(8);
        hub.register(slow, slow_tx).expect("register slow");
        hub.register(fast, fast_tx).expect("register fast");

        hub.broadcast(Bytes::from_static(b"one")).expect("broadcast");
        hub.broadcast(Bytes::from_static(b"two")).expect("broadcast");
        hub.broadcast(Bytes::from_static(b"three")).expect("broadcast");

        let status = hub.status().await.expect("status");
        assert_eq!(status.clients, vec![fast]);
        assert_eq!(status.evictions, 1);

        assert_eq!(slow_rx.recv().await, Some(Bytes::from_static(b"one")));
        assert_eq!(slow_rx.recv().await, None, "queue closed after eviction");

        for expected in ["one", "two", "three"] {
            assert_eq!(fast_rx.recv().await, Some(Bytes::from(expected)));
        }
    }

    #[tokio::test]
    async fn unregistering_an_evicted_client_is_a_noop() {
        let (hub, _task) = Hub::spawn();
        let (id, tx, _rx) = client(1);
        hub.register(id, tx).expect("register");
        hub.broadcast(Bytes::from_static(b"fill")).expect("broadcast");
        hub.broadcast(Bytes::from_static(b"overflow")).expect("broadcast");
        hub.unregister(id).expect("unregister after eviction");
        hub.unregister(id).expect("unregister again");

        let status = hub.status().await.expect("status");
        assert!(status.clients.is_empty());
        assert_eq!(status.evictions, 1);
    }

    #[tokio::test]
    async fn closed_consumer_is_evicted_on_next_broadcast() {
        let (hub, _task) = Hub::spawn();
        let (id, tx, rx) = client(4);
        hub.register(id, tx).expect("register");
        drop(rx);

        hub.broadcast(Bytes::from_static(b"anyone?")).expect("broadcast");
        let status = hub.status().await.expect("status");
        assert!(status.clients.is_empty());
        assert_eq!(status.evictions, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_the_first_queue() {
        let (hub, _task) = Hub::spawn();
        let (id, first_tx, mut first_rx) = client(4);
        let (second_tx, mut second_rx) = mpsc::channel(4);
        hub.register(id, first_tx).expect("register");
        hub.register(id, second_tx).expect("register duplicate");

        hub.broadcast(Bytes::from_static(b"x")).expect("broadcast");
        let status = hub.status().await.expect("status");
        assert_eq!(status.clients, vec![id]);

        assert_eq!(first_rx.recv().await, Some(Bytes::from_static(b"x")));
        assert_eq!(second_rx.recv().await, None, "duplicate queue dropped");
    }

    #[tokio::test]
    async fn shutdown_closes_queues_and_stops_the_loop() {
        let (hub, task) = Hub::spawn();
        let (id, tx, mut rx) = client(4);
        hub.register(id, tx).expect("register");

        hub.shutdown().expect("shutdown");
        task.await.expect("hub task");

        assert_eq!(rx.recv().await, None);
        assert_eq!(hub.broadcast(Bytes::new()), Err(HubError::Stopped));
        assert_eq!(hub.status().await, Err(HubError::Stopped));
    }

    #[tokio::test]
    async fn loop_ends_when_every_handle_is_dropped() {
        let (hub, task) = Hub::spawn();
        drop(hub);
        task.await.expect("hub task");
    }
}
