//! Connection Registry implementation.
//!
//! Tracks the live connection of each user for direct message delivery.

use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::message::UserId;

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A text frame (encoded message or notice)
    Text(String),
    /// Reply to a transport-level ping
    Pong(Vec<u8>),
    /// Ask the writer to close the transport
    Close,
}

/// Outbound handle of a live connection.
///
/// Cloned out of the registry for delivery; sends never block.
pub type ConnectionHandle = mpsc::Sender<OutboundFrame>;

/// Result of registering a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The handle is now the user's live connection
    Registered,
    /// Another connection already holds this user id; the registry is unchanged
    AlreadyConnected,
}

/// Result of attempting to send a frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Frame was queued for delivery
    Sent,
    /// The recipient is not currently connected
    NotConnected,
    /// The recipient's outbound channel is full (backpressure)
    ChannelFull,
    /// The recipient's outbound channel is closed
    ChannelClosed,
}

impl SendResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendResult::Sent)
    }
}

/// Registry for tracking live connections.
///
/// Thread-safe map from user id to outbound handle. Uses DashMap for
/// concurrent access without explicit locking; each operation is atomic
/// with respect to the others.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// // When a connection is accepted:
/// let (tx, rx) = mpsc::channel(256);
/// if registry.register(user, tx.clone()) == Registration::AlreadyConnected {
///     // continue unregistered
/// }
///
/// // When routing a message:
/// let result = registry.send_to(&recipient, OutboundFrame::Text(json));
///
/// // When the connection ends:
/// registry.remove_if_owner(&user, &tx);
/// ```
pub struct ConnectionRegistry {
    connections: DashMap<UserId, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection with its outbound handle.
    ///
    /// First writer wins: if the user id is already registered the existing
    /// entry is left in place and `AlreadyConnected` is returned.
    #[instrument(skip(self, handle), fields(user = %user))]
    pub fn register(&self, user: UserId, handle: ConnectionHandle) -> Registration {
        match self.connections.entry(user) {
            Entry::Occupied(_) => {
                info!("User already connected, keeping existing connection");
                Registration::AlreadyConnected
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
                debug!("Registered new connection");
                Registration::Registered
            }
        }
    }

    /// Look up the live handle for a user.
    pub fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.connections.get(user).map(|entry| entry.value().clone())
    }

    /// Remove a user's entry unconditionally. Removing an absent key is a no-op.
    #[instrument(skip(self), fields(user = %user))]
    pub fn remove(&self, user: &UserId) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(user);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Connection was not registered");
        }
        removed.map(|(_, handle)| handle)
    }

    /// Remove a user's entry only if it is still `handle`.
    ///
    /// A connection that lost the registration race must not evict the
    /// connection that won it.
    #[instrument(skip(self, handle), fields(user = %user))]
    pub fn remove_if_owner(&self, user: &UserId, handle: &ConnectionHandle) -> bool {
        let removed = self
            .connections
            .remove_if(user, |_, current| current.same_channel(handle))
            .is_some();
        if removed {
            debug!("Unregistered connection");
        }
        removed
    }

    /// Check if a user is currently connected.
    pub fn is_connected(&self, user: &UserId) -> bool {
        self.connections.contains_key(user)
    }

    /// Get the number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a frame for a connected user without blocking.
    #[instrument(skip(self, frame), fields(to = %user))]
    pub fn send_to(&self, user: &UserId, frame: OutboundFrame) -> SendResult {
        let handle = match self.lookup(user) {
            Some(handle) => handle,
            None => {
                debug!("Recipient not connected");
                return SendResult::NotConnected;
            }
        };

        match handle.try_send(frame) {
            Ok(()) => {
                debug!("Frame queued for delivery");
                SendResult::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel closed, connection may have dropped");
                self.remove_if_owner(user, &handle);
                SendResult::ChannelClosed
            }
        }
    }

    /// Remove entries whose channel has been closed.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, handle| !handle.is_closed());
        let removed = before.saturating_sub(self.connections.len());
        if removed > 0 {
            info!(removed, "Cleaned up stale connections");
        }
        removed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connection_count())
            .finish()
    }
}
