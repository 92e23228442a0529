//! Live connection tracking.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{PeerCredentials, RequestContext, RequestHandler};

/// Listener-assigned connection id, unique for the listener's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Id.
    pub id: ConnectionId,
    /// Kernel-reported peer credentials.
    pub peer: PeerCredentials,
    /// When the connection passed the accept policy.
    pub accepted_at: Instant,
    /// Whether a request is being handled right now.
    pub in_flight: bool,
}

/// Callbacks for connection lifecycle events.
///
/// All methods default to doing nothing. Calls happen on the listener's
/// tasks and must not block.
pub trait ConnectionObserver: Send + Sync {
    /// A peer passed the accept policy.
    fn on_accepted(&self, _record: &ConnectionRecord) {}

    /// A peer was refused by the accept policy, at accept or when it was
    /// confirmed after the handshake.
    fn on_rejected(&self, _peer: &PeerCredentials, _reason: &str) {}

    /// The peer went away (clean close or crash).
    fn on_invalidated(&self, _id: ConnectionId) {}

    /// The transport failed.
    fn on_interrupted(&self, _id: ConnectionId, _reason: &str) {}
}

/// Connections currently being served.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `record`.
    pub fn insert(&self, record: ConnectionRecord) {
        self.lock().insert(record.id, record);
    }

    /// Stop tracking `id`, returning its record.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.lock().remove(&id)
    }

    /// Mark whether `id` has a request in progress.
    pub fn set_in_flight(&self, id: ConnectionId, in_flight: bool) {
        if let Some(record) = self.lock().get_mut(&id) {
            record.in_flight = in_flight;
        }
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of connections with a request in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().values().filter(|r| r.in_flight).count()
    }

    /// Copy of every record, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

/// Wraps a handler so the registry knows when a request is in flight.
pub(crate) struct TrackedHandler {
    pub(crate) inner: Arc<dyn RequestHandler>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) id: ConnectionId,
}

#[async_trait]
impl RequestHandler for TrackedHandler {
    async fn handle(&self, frame: Bytes, ctx: &RequestContext) -> Bytes {
        self.registry.set_in_flight(self.id, true);
        let reply = self.inner.handle(frame, ctx).await;
        self.registry.set_in_flight(self.id, false);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> ConnectionRecord {
        ConnectionRecord {
            id: ConnectionId::new(id),
            peer: PeerCredentials {
                uid: 501,
                gid: 20,
                pid: Some(1),
                start_time: None,
            },
            accepted_at: Instant::now(),
            in_flight: false,
        }
    }

    #[test]
    fn test_insert_remove() {
        let registry = ConnectionRegistry::new();
        registry.insert(record(2));
        registry.insert(record(1));
        assert_eq!(registry.len(), 2);

        let ids: Vec<_> = registry.snapshot().iter().map(|r| r.id.get()).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(registry.remove(ConnectionId::new(1)).is_some());
        assert!(registry.remove(ConnectionId::new(1)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_in_flight_tracking() {
        let registry = ConnectionRegistry::new();
        registry.insert(record(1));
        registry.set_in_flight(ConnectionId::new(1), true);
        assert_eq!(registry.in_flight(), 1);
        registry.set_in_flight(ConnectionId::new(1), false);
        assert_eq!(registry.in_flight(), 0);

        // Unknown ids are ignored.
        registry.set_in_flight(ConnectionId::new(9), true);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }
}
