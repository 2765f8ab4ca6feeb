//! Connection registry and broadcast router.
//!
//! A single task owns the set of live connections. Membership changes
//! and broadcasts arrive on one command queue and are applied in order,
//! so every connection sees broadcasts in the same global order and
//! no lock guards the membership set itself.
//!
//! ```text
//! register ─┐
//! unregister┼──► HubLoop ──try_send──► conn A queue ──► writer A
//! broadcast ┤    (single    ├─────────► conn B queue ──► writer B
//! kick     ─┘     writer)   └─────────► conn C queue (full) ✗ evicted
//! ```
//!
//! Delivery never blocks: a connection whose bounded queue is full is
//! dropped from the registry on the spot and announced as a `user_leave`.
//! A read-mostly roster snapshot serves `list_online` without going
//! through the loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::{Envelope, ProtocolError};
use crate::state::SharedState;

/// One serialized envelope, shared by every queue it is fanned out to.
pub type Frame = Arc<str>;

/// Hub-side end of a connection: identity, outbound queue, kill switch.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    identity: Identity,
    outbound: mpsc::Sender<Frame>,
    kill: watch::Sender<bool>,
}

/// Session-side end of a connection, drained by its writer.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: mpsc::Receiver<Frame>,
    kill: watch::Receiver<bool>,
}

impl ConnectionHandle {
    /// Create a connection with an outbound queue of `capacity` frames.
    pub fn new(identity: Identity, capacity: usize) -> (Self, OutboundQueue) {
        let (outbound, frames) = mpsc::channel(capacity.max(1));
        let (kill, kill_rx) = watch::channel(false);
        let handle = Self {
            id: Uuid::new_v4(),
            identity,
            outbound,
            kill,
        };
        (handle, OutboundQueue { frames, kill: kill_rx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Ask the session to close its socket immediately.
    fn force_close(&self) {
        let _ = self.kill.send(true);
    }
}

impl OutboundQueue {
    /// Next frame; `None` once the hub dropped the connection and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    /// Receiver that flips to `true` when the connection is kicked or the
    /// hub shuts down. It errors once the hub has dropped the connection.
    pub fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill.clone()
    }
}

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections_registered: u64,
    pub active_connections: u64,
    pub broadcasts: u64,
    pub frames_delivered: u64,
    pub slow_consumers_evicted: u64,
    pub kicks: u64,
}

/// Lock-free counters behind [`HubStats`].
#[derive(Default)]
struct AtomicHubStats {
    connections_registered: AtomicU64,
    active_connections: AtomicU64,
    broadcasts: AtomicU64,
    frames_delivered: AtomicU64,
    slow_consumers_evicted: AtomicU64,
    kicks: AtomicU64,
}

impl AtomicHubStats {
    fn snapshot(&self) -> HubStats {
        HubStats {
            connections_registered: self.connections_registered.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            slow_consumers_evicted: self.slow_consumers_evicted.load(Ordering::Relaxed),
            kicks: self.kicks.load(Ordering::Relaxed),
        }
    }
}

enum HubCommand {
    Register(ConnectionHandle),
    Unregister(Uuid),
    Broadcast(Frame),
    Kick {
        username: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Handle to the hub loop. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    roster: Arc<RwLock<Vec<Identity>>>,
    stats: Arc<AtomicHubStats>,
}

impl Hub {
    /// Spawn the hub loop on the current runtime.
    ///
    /// The loop reads `state` to build the `init` envelope for each new
    /// connection at the moment it is registered.
    pub fn start(state: Arc<SharedState>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let roster = Arc::new(RwLock::new(Vec::new()));
        let stats = Arc::new(AtomicHubStats::default());

        let hub_loop = HubLoop {
            commands: rx,
            connections: Vec::new(),
            roster: roster.clone(),
            stats: stats.clone(),
            state,
        };
        tokio::spawn(hub_loop.run());

        Self {
            commands,
            roster,
            stats,
        }
    }

    /// Add a connection. The loop pushes `init` straight into its queue
    /// and then broadcasts `user_join` with the updated roster.
    pub fn register(&self, connection: ConnectionHandle) {
        self.send(HubCommand::Register(connection));
    }

    /// Remove a connection and broadcast `user_leave`. No-op if the
    /// connection is already gone (evicted, kicked, or unregistered).
    pub fn unregister(&self, id: Uuid) {
        self.send(HubCommand::Unregister(id));
    }

    /// Fan an envelope out to every registered connection, sender included.
    pub fn broadcast(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let frame: Frame = envelope.encode()?.into();
        self.broadcast_frame(frame);
        Ok(())
    }

    /// Broadcast an already encoded frame.
    pub fn broadcast_frame(&self, frame: Frame) {
        self.send(HubCommand::Broadcast(frame));
    }

    /// Forcibly remove every connection of `username` and close their
    /// sockets. Returns how many connections were removed.
    ///
    /// No `user_leave` is emitted for kicked connections; the caller
    /// announces the kick itself.
    pub async fn kick(&self, username: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Kick {
            username: username.to_string(),
            reply,
        });
        rx.await.unwrap_or(0)
    }

    /// Close every connection and stop the loop.
    pub fn shutdown(&self) {
        self.send(HubCommand::Shutdown);
    }

    /// Point-in-time set of online identities, in join order.
    pub async fn list_online(&self) -> Vec<Identity> {
        self.roster.read().await.clone()
    }

    /// Online usernames, in join order.
    pub async fn online_usernames(&self) -> Vec<String> {
        self.roster
            .read()
            .await
            .iter()
            .map(|identity| identity.username.clone())
            .collect()
    }

    pub fn stats(&self) -> HubStats {
        self.stats.snapshot()
    }

    /// Whether the loop is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: HubCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("Hub loop has stopped; command dropped");
        }
    }
}

/// The single writer of the connection set.
struct HubLoop {
    commands: mpsc::UnboundedReceiver<HubCommand>,
    /// Live connections in registration order
    connections: Vec<ConnectionHandle>,
    roster: Arc<RwLock<Vec<Identity>>>,
    stats: Arc<AtomicHubStats>,
    state: Arc<SharedState>,
}

impl HubLoop {
    async fn run(mut self) {
        log::debug!("Hub loop started");

        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(connection) => self.register(connection).await,
                HubCommand::Unregister(id) => self.unregister(id).await,
                HubCommand::Broadcast(frame) => {
                    self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
                    self.fan_out(frame).await;
                }
                HubCommand::Kick { username, reply } => {
                    let removed = self.kick(&username).await;
                    let _ = reply.send(removed);
                }
                HubCommand::Shutdown => break,
            }
        }

        self.roster.write().await.clear();
        self.stats.active_connections.store(0, Ordering::Relaxed);
        for connection in self.connections.drain(..) {
            connection.force_close();
        }
        log::info!("Hub loop stopped");
    }

    async fn register(&mut self, connection: ConnectionHandle) {
        let init = Envelope::init(self.state.init_data().await);
        match init.encode() {
            Ok(text) => {
                if connection.outbound.try_send(text.into()).is_err() {
                    log::warn!(
                        "Could not queue init for {}; dropping connection",
                        connection.identity.username
                    );
                    return;
                }
            }
            Err(e) => {
                log::error!("Failed to encode init envelope: {e}");
                return;
            }
        }

        let username = connection.identity.username.clone();
        log::info!("{username} joined ({})", connection.id);
        self.connections.push(connection);
        self.stats.connections_registered.fetch_add(1, Ordering::Relaxed);
        self.publish_roster().await;

        let join = Envelope::user_join(&username, self.usernames());
        self.fan_out_envelope(&join).await;
    }

    async fn unregister(&mut self, id: Uuid) {
        let Some(pos) = self.connections.iter().position(|c| c.id == id) else {
            return;
        };
        let connection = self.connections.remove(pos);
        let username = connection.identity.username.clone();
        // Dropping the handle closes the queue; the writer drains and exits.
        drop(connection);
        log::info!("{username} left ({id})");

        self.publish_roster().await;
        let leave = Envelope::user_leave(&username, self.usernames());
        self.fan_out_envelope(&leave).await;
    }

    async fn kick(&mut self, username: &str) -> usize {
        let before = self.connections.len();
        self.connections.retain(|connection| {
            if connection.identity.username == username {
                connection.force_close();
                false
            } else {
                true
            }
        });
        let removed = before - self.connections.len();
        if removed > 0 {
            self.stats.kicks.fetch_add(removed as u64, Ordering::Relaxed);
            self.publish_roster().await;
            log::info!("Kicked {username} ({removed} connection(s))");
        }
        removed
    }

    async fn fan_out_envelope(&mut self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(text) => self.fan_out(text.into()).await,
            Err(e) => log::error!("Failed to encode {} envelope: {e}", envelope.kind()),
        }
    }

    /// Deliver `frame` to every connection without blocking.
    ///
    /// Connections whose queue is full (or whose writer is gone) are
    /// removed, and a `user_leave` for each of them is fanned out in turn.
    async fn fan_out(&mut self, frame: Frame) {
        let mut pending = VecDeque::from([frame]);

        while let Some(frame) = pending.pop_front() {
            let mut evicted = Vec::new();
            let stats = &self.stats;

            self.connections.retain(|connection| {
                match connection.outbound.try_send(frame.clone()) {
                    Ok(()) => {
                        stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Slow consumer {} ({}): outbound queue full, disconnecting",
                            connection.identity.username,
                            connection.id
                        );
                        stats.slow_consumers_evicted.fetch_add(1, Ordering::Relaxed);
                        evicted.push(connection.identity.username.clone());
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::debug!("Writer for {} already gone", connection.id);
                        evicted.push(connection.identity.username.clone());
                        false
                    }
                }
            });

            if evicted.is_empty() {
                continue;
            }

            self.publish_roster().await;
            for username in evicted {
                let leave = Envelope::user_leave(&username, self.usernames());
                match leave.encode() {
                    Ok(text) => pending.push_back(text.into()),
                    Err(e) => log::error!("Failed to encode user_leave: {e}"),
                }
            }
        }
    }

    /// Deduplicated usernames in join order.
    fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.connections.len());
        for connection in &self.connections {
            if !names.contains(&connection.identity.username) {
                names.push(connection.identity.username.clone());
            }
        }
        names
    }

    async fn publish_roster(&self) {
        let mut identities: Vec<Identity> = Vec::with_capacity(self.connections.len());
        for connection in &self.connections {
            if !identities
                .iter()
                .any(|i| i.username == connection.identity.username)
            {
                identities.push(connection.identity.clone());
            }
        }
        *self.roster.write().await = identities;
        self.stats
            .active_connections
            .store(self.connections.len() as u64, Ordering::Relaxed);
    }
}
