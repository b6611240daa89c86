//! The `transport` module is responsible for network communication with
//! clients.
//!
//! It defines both protocol vocabularies (NT4 JSON control messages and
//! msgpack value frames, NT3 binary messages), the `WireConnection`
//! abstraction sessions write through, and the two listeners: NT4 over
//! WebSockets and NT3 over plain TCP. Every connection task forwards what it
//! reads to the shared `ServerImpl` and drains its writer channel to the
//! socket.

pub mod codec;
pub mod message;
pub mod tcp;
pub mod websocket;
pub mod wire;
pub mod wire3;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::engine::{ConnectionInfo, ServerImpl, SharedServer, lock};
use crate::client::ClientId;

/// Live connections, keyed by client slot, used to build `$clients`.
///
/// Kept apart from the server lock so the NT3 connected callback (which runs
/// while the server is locked) can record a connection without re-locking.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<Mutex<BTreeMap<ClientId, ConnectionInfo>>>,
    changed: Arc<AtomicBool>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn conns(&self) -> std::sync::MutexGuard<'_, BTreeMap<ClientId, ConnectionInfo>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, id: ClientId, info: ConnectionInfo) {
        self.conns().insert(id, info);
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn remove(&self, id: ClientId) {
        if self.conns().remove(&id).is_some() {
            self.changed.store(true, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.conns().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conns().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Republish `$clients` if anything changed since the last call.
    pub fn publish_if_changed(&self, server: &mut ServerImpl) {
        if self.changed.swap(false, Ordering::SeqCst) {
            server.connections_changed(&self.snapshot());
        }
    }
}

pub fn connection_info(name: &str, peer: &SocketAddr, protocol_version: u16) -> ConnectionInfo {
    ConnectionInfo {
        remote_id: name.to_string(),
        remote_ip: peer.ip().to_string(),
        remote_port: peer.port(),
        protocol_version,
    }
}

/// Cleanup shared by both listeners once a connection's reader ends.
pub(crate) fn close_connection(server: &SharedServer, registry: &ConnectionRegistry, id: ClientId) {
    let mut server = lock(server);
    // dropping the wire closes the writer channel
    drop(server.remove_client(id));
    registry.remove(id);
    registry.publish_if_changed(&mut server);
}
