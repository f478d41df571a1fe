use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rescue_core::{Capabilities, Capability, ConnectionId, Position};
use serde::Serialize;
use tokio::sync::mpsc;

/// Sweep period. Fixed: a client that misses one ping is gone within two periods.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Frames queued for a connection's socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Ping,
}

/// The part of a connection record that message handlers read and replace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionState {
    pub capabilities: Capabilities,
    pub user_id: Option<String>,
    pub location: Option<Position>,
}

impl ConnectionState {
    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }
}

/// One open socket.
pub struct Connection {
    pub id: ConnectionId,
    pub origin: String,
    pub connected_at: DateTime<Utc>,
    state: ConnectionState,
    alive: AtomicBool,
    tx: mpsc::Sender<Outgoing>,
}

impl Connection {
    fn new(id: ConnectionId, origin: String, tx: mpsc::Sender<Outgoing>) -> Self {
        Self {
            id,
            origin,
            connected_at: Utc::now(),
            state: ConnectionState::default(),
            alive: AtomicBool::new(true),
            tx,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn enqueue(&self, frame: Outgoing) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(connection_id = %self.id, "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Which peers a broadcast is meant for. The sender is always excluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    RescueTeam,
    MapSubscribers,
    /// Every open connection regardless of role.
    Everyone,
}

impl Audience {
    pub fn admits(self, caps: &Capabilities) -> bool {
        match self {
            Self::RescueTeam => caps.contains(Capability::RescueTeam),
            Self::MapSubscribers => caps.contains(Capability::MapSubscriber),
            Self::Everyone => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RescueTeam => "rescue_team",
            Self::MapSubscribers => "map_subscribers",
            Self::Everyone => "everyone",
        }
    }
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub evicted: Vec<ConnectionId>,
    pub pinged: usize,
}

/// Connection counts exposed on the health endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connected: usize,
    pub rescue_teams: usize,
    pub map_subscribers: usize,
}

/// All open connections, keyed by id.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Admit a connection with default state. The receiver feeds its socket writer;
    /// once the record is removed the receiver yields `None`.
    pub fn register(&self, origin: impl Into<String>) -> (ConnectionId, mpsc::Receiver<Outgoing>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections
            .insert(id.clone(), Connection::new(id.clone(), origin.into(), tx));
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Transport-level pong received.
    pub fn mark_alive(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.alive.store(true, Ordering::Relaxed);
        }
    }

    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.connections.get(id).map(|c| c.state.clone())
    }

    /// Replace the handler-visible state of one connection.
    pub fn update_state(&self, id: &ConnectionId, state: ConnectionState) -> bool {
        match self.connections.get_mut(id) {
            Some(mut conn) => {
                conn.state = state;
                true
            }
            None => false,
        }
    }

    /// Queue a text frame for one connection.
    pub fn send_to(&self, id: &ConnectionId, text: String) -> bool {
        self.connections
            .get(id)
            .is_some_and(|conn| conn.enqueue(Outgoing::Text(text)))
    }

    /// Queue `text` for every connection in `audience` except `exclude`.
    /// Unreachable peers are skipped; returns how many frames were queued.
    pub fn broadcast(&self, audience: Audience, exclude: Option<&ConnectionId>, text: &str) -> usize {
        self.connections
            .iter()
            .filter(|conn| Some(conn.key()) != exclude)
            .filter(|conn| audience.admits(&conn.state.capabilities))
            .filter(|conn| conn.enqueue(Outgoing::Text(text.to_owned())))
            .count()
    }

    /// Evict connections that did not answer the previous ping, then ping the rest.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let silent: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|conn| !conn.is_alive())
            .map(|conn| conn.key().clone())
            .collect();
        for id in silent {
            // A pong may have landed since the scan.
            if self.connections.remove_if(&id, |_, conn| !conn.is_alive()).is_some() {
                report.evicted.push(id);
            }
        }

        for conn in self.connections.iter() {
            conn.alive.store(false, Ordering::Relaxed);
            if conn.enqueue(Outgoing::Ping) {
                report.pinged += 1;
            }
        }
        report
    }

    pub fn stats(&self) -> RegistryStats {
        self.connections
            .iter()
            .fold(RegistryStats::default(), |mut stats, conn| {
                stats.connected += 1;
                if conn.state.has(Capability::RescueTeam) {
                    stats.rescue_teams += 1;
                }
                if conn.state.has(Capability::MapSubscriber) {
                    stats.map_subscribers += 1;
                }
                stats
            })
    }
}
