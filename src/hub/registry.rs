//! Connection registry and group broadcaster.
//!
//! Group membership is kept as two indexes, `connection -> groups` and
//! `group -> connections`, both mutated only through this module under one
//! lock. Broadcasts copy out the target handles under the read lock and send
//! after releasing it, so a slow connection never holds up joins or other
//! broadcasts.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Opaque connection identifier.
pub type ConnectionId = String;

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Transport open, handshake not finished. Not a broadcast target.
    Connecting = 0,
    Connected = 1,
    /// Terminal.
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Why a frame could not be handed to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection is not connected")]
    NotConnected,

    #[error("outbound queue closed")]
    Closed,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Registry-owned view of one live connection: its id, lifecycle state and
/// the sending half of its outbound frame queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Bytes>,
    state: AtomicU8,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(id: impl Into<ConnectionId>, sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: id.into(),
            sender,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time since the transport was accepted.
    pub fn open_for(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }

    /// Connecting -> Connected. Returns false from any other state.
    pub fn mark_connected(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to Disconnected. Returns the previous state.
    pub fn mark_disconnected(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Disconnected as u8, Ordering::SeqCst),
        )
    }

    /// Queue a frame, waiting at most `timeout` for room in the queue.
    pub async fn send(&self, frame: Bytes, timeout: Duration) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        match tokio::time::timeout(timeout, self.sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout(timeout)),
        }
    }

    /// Queue a frame without waiting and regardless of state.
    ///
    /// Only used for the handshake response, which must reach the queue before
    /// the connection becomes a broadcast target.
    pub(crate) fn try_send_raw(&self, frame: Bytes) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Timeout(Duration::ZERO),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

impl Delivery {
    pub fn targets(&self) -> usize {
        self.delivered + self.failed
    }
}

#[derive(Default)]
struct Tables {
    connections: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    groups: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

/// Tracks live connections and their group memberships.
pub struct ConnectionRegistry {
    tables: RwLock<Tables>,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            send_timeout,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection. Replaces any previous handle with the same id.
    pub fn add(&self, handle: Arc<ConnectionHandle>) {
        let mut tables = self.write();
        tables.connections.insert(handle.id().to_string(), handle);
    }

    /// Disconnect and forget a connection, dropping all of its memberships.
    ///
    /// Idempotent: returns `None` if the id is not registered.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        let mut tables = self.write();
        let handle = tables.connections.remove(connection_id)?;
        handle.mark_disconnected();

        if let Some(groups) = tables.memberships.remove(connection_id) {
            for group in groups {
                if let Some(members) = tables.groups.get_mut(&group) {
                    members.remove(connection_id);
                    if members.is_empty() {
                        tables.groups.remove(&group);
                    }
                }
            }
        }

        Some(handle)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.read().connections.get(connection_id).cloned()
    }

    /// Add a connected connection to a group, creating the group if needed.
    ///
    /// Idempotent. Returns false if the connection is unknown or not connected.
    pub fn join(&self, connection_id: &str, group: &str) -> bool {
        let mut tables = self.write();
        match tables.connections.get(connection_id) {
            Some(handle) if handle.is_connected() => {}
            _ => return false,
        }

        tables
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());
        tables
            .memberships
            .entry(connection_id.to_string())
            .or_default()
            .insert(group.to_string());

        debug!(connection_id = %connection_id, group = %group, "Joined group");
        true
    }

    /// Remove a connection from a group. Empty groups are dropped.
    ///
    /// Returns true if the connection was a member.
    pub fn leave(&self, connection_id: &str, group: &str) -> bool {
        let mut tables = self.write();

        let was_member = match tables.groups.get_mut(group) {
            Some(members) => {
                let removed = members.remove(connection_id);
                if members.is_empty() {
                    tables.groups.remove(group);
                }
                removed
            }
            None => false,
        };

        if let Some(groups) = tables.memberships.get_mut(connection_id) {
            groups.remove(group);
            if groups.is_empty() {
                tables.memberships.remove(connection_id);
            }
        }

        if was_member {
            debug!(connection_id = %connection_id, group = %group, "Left group");
        }
        was_member
    }

    /// Groups a connection belongs to, sorted.
    pub fn groups_of(&self, connection_id: &str) -> Vec<String> {
        let tables = self.read();
        let mut groups: Vec<String> = tables
            .memberships
            .get(connection_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Members of a group, sorted.
    pub fn members_of(&self, group: &str) -> Vec<ConnectionId> {
        let tables = self.read();
        let mut members: Vec<ConnectionId> = tables
            .groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn group_count(&self) -> usize {
        self.read().groups.len()
    }

    /// Deliver to every connected connection.
    pub async fn broadcast_all(&self, frame: Bytes) -> Delivery {
        let targets: Vec<_> = {
            let tables = self.read();
            tables
                .connections
                .values()
                .filter(|handle| handle.is_connected())
                .cloned()
                .collect()
        };
        self.deliver(targets, frame).await
    }

    /// Deliver to every connected member of `group`. No-op for unknown groups.
    pub async fn broadcast_group(&self, group: &str, frame: Bytes) -> Delivery {
        let targets = self.group_targets(group, None);
        self.deliver(targets, frame).await
    }

    /// Deliver to every connected member of `group` except `sender`.
    pub async fn broadcast_others_in_group(
        &self,
        group: &str,
        sender: &str,
        frame: Bytes,
    ) -> Delivery {
        let targets = self.group_targets(group, Some(sender));
        self.deliver(targets, frame).await
    }

    /// Deliver to a single connection.
    pub async fn send_connection(&self, connection_id: &str, frame: Bytes) -> Delivery {
        let targets: Vec<_> = self
            .get(connection_id)
            .filter(|handle| handle.is_connected())
            .into_iter()
            .collect();
        self.deliver(targets, frame).await
    }

    fn group_targets(&self, group: &str, excluded: Option<&str>) -> Vec<Arc<ConnectionHandle>> {
        let tables = self.read();
        let Some(members) = tables.groups.get(group) else {
            return Vec::new();
        };

        members
            .iter()
            .filter(|id| Some(id.as_str()) != excluded)
            .filter_map(|id| tables.connections.get(id))
            .filter(|handle| handle.is_connected())
            .cloned()
            .collect()
    }

    /// Send one frame to every target concurrently, each bounded by the send
    /// timeout. Failures are logged and counted, never returned.
    async fn deliver(&self, targets: Vec<Arc<ConnectionHandle>>, frame: Bytes) -> Delivery {
        let timeout = self.send_timeout;
        let sends = targets.iter().map(|handle| {
            let frame = frame.clone();
            async move { (handle, handle.send(frame, timeout).await) }
        });

        let mut delivery = Delivery::default();
        for (handle, result) in join_all(sends).await {
            match result {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(connection_id = %handle.id(), error = %e, "Failed to deliver message");
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }
}
