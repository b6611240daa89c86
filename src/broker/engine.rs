//! Server engine
//!
//! `ServerImpl` ties storage to the connected clients:
//! - accepting NT4 and NT3 clients and assigning them slots and unique names
//! - routing incoming text/binary frames to the right protocol handler
//! - draining deferred incoming values and sending queued outgoing data
//! - serving the in-process local client
//! - publishing the `$clients` list and loading/saving persistent topics
//!
//! Concurrency and usage notes:
//! - The API is synchronous and meant to sit behind a lock
//!   (`Arc<Mutex<ServerImpl>>`) shared by the transport tasks. Nothing here
//!   blocks or awaits; writes go to each connection's channel-backed wire.
//! - The periodic loop should run as a background task; it is what actually
//!   pushes queued values out and works through backlogged input.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Map;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::broker::meta::{self, ClientInfo};
use crate::broker::storage::ServerStorage;
use crate::broker::topic::{ServerTopic, TopicId};
use crate::client::nt3::{self, Connected3Fn};
use crate::client::nt4::{self, Nt4Handler};
use crate::client::{
    ClientData, ClientId, ClientTable, LOCAL_CLIENT, LocalEvent, LocalRequest, LocalSession,
    SessionKind, Session3, Session4,
};
use crate::transport::wire::WireConnection;
use crate::utils::time::now_millis;

pub type SharedServer = Arc<Mutex<ServerImpl>>;

/// Lock the shared server, recovering the guard if a holder panicked.
pub fn lock(server: &SharedServer) -> MutexGuard<'_, ServerImpl> {
    server.lock().unwrap_or_else(|e| e.into_inner())
}

/// One entry of the `$clients` list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub remote_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub protocol_version: u16,
}

/// Announce a new topic to every client with a matching subscriber.
fn send_announce(topic: &mut ServerTopic, clients: &mut ClientTable, origin: Option<ClientId>) {
    for client in clients.iter_mut() {
        let subuids = client.matching_subscribers(&topic.name, topic.special);
        if subuids.is_empty() {
            continue;
        }
        let tcd = topic.clients.entry(client.id()).or_default();
        for subuid in &subuids {
            if let Some(sub) = client.subscribers.get(subuid) {
                tcd.add_subscriber(*subuid, &sub.options);
            }
        }
        tcd.refresh_send_mode(&client.subscribers);
        let snapshot = tcd.clone();
        client.update_period(topic.id, &snapshot);

        if Some(client.id()) == origin {
            continue;
        }
        client.send_announce(topic, None);
    }
}

pub struct ServerImpl {
    storage: ServerStorage,
    clients: ClientTable,
    meta_clients: TopicId,
}

impl Default for ServerImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerImpl {
    /// Incoming values applied per client per `process_incoming_messages`.
    pub const MAX_BACKLOG_BATCH: usize = 100;

    pub fn new() -> Self {
        let mut storage = ServerStorage::new(send_announce);
        let mut clients = ClientTable::new();
        clients.insert_with(|id| {
            ClientData::new(
                id,
                "",
                "",
                "",
                true,
                SessionKind::Local(LocalSession::new()),
            )
        });

        let meta_clients = storage.create_meta_topic(&mut clients, meta::CLIENTS_TOPIC);
        let meta_pub = storage.create_meta_topic(&mut clients, meta::SERVER_PUB_TOPIC);
        let meta_sub = storage.create_meta_topic(&mut clients, meta::SERVER_SUB_TOPIC);
        if let Some(local) = clients.get_mut(LOCAL_CLIENT) {
            local.meta_pub = Some(meta_pub);
            local.meta_sub = Some(meta_sub);
        }
        storage.update_meta_client_pub(&mut clients, LOCAL_CLIENT);
        storage.update_meta_client_sub(&mut clients, LOCAL_CLIENT);

        Self {
            storage,
            clients,
            meta_clients,
        }
    }

    pub fn storage(&self) -> &ServerStorage {
        &self.storage
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientData> {
        self.clients.get(id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut ClientData> {
        self.clients.get_mut(id)
    }

    /// Route local-side events to `events`.
    pub fn set_local_events(&mut self, events: UnboundedSender<LocalEvent>) {
        let local = self.clients.get_mut(LOCAL_CLIENT).map(|c| &mut c.kind);
        if let Some(SessionKind::Local(session)) = local {
            session.set_events(events);
        }
    }

    /// Register an NT4 client. The name is the part of `name` before any
    /// '@' ("NT4" if empty); a name already in use gets `@<slot>` appended.
    /// Returns the final name and the client's slot.
    pub fn add_client(
        &mut self,
        name: &str,
        conn_info: &str,
        local: bool,
        wire: Box<dyn WireConnection>,
    ) -> (String, ClientId) {
        let base = match name.split('@').next() {
            Some(base) if !base.is_empty() => base.to_string(),
            _ => "NT4".to_string(),
        };
        let duplicate = self.clients.iter().any(|c| c.original_name() == base);

        let mut final_name = base.clone();
        let id = self.clients.insert_with(|id| {
            if duplicate {
                final_name = format!("{base}@{id}");
            }
            ClientData::new(
                id,
                &base,
                &final_name,
                conn_info,
                local,
                SessionKind::V4(Session4::new(wire, local)),
            )
        });

        self.storage.create_client_meta_topics(&mut self.clients, id);
        self.storage.update_meta_client_pub(&mut self.clients, id);
        self.storage.update_meta_client_sub(&mut self.clients, id);

        info!("client {final_name} connected from {conn_info}");
        (final_name, id)
    }

    /// Register an NT3 client. It has no name until its hello arrives;
    /// `connected` runs at that point.
    pub fn add_client3(
        &mut self,
        conn_info: &str,
        local: bool,
        wire: Box<dyn WireConnection>,
        connected: Option<Connected3Fn>,
    ) -> ClientId {
        self.clients.insert_with(|id| {
            ClientData::new(
                id,
                "",
                "",
                conn_info,
                local,
                SessionKind::V3(Session3::new(wire, local, connected)),
            )
        })
    }

    /// Tear down a client and hand back its wire.
    pub fn remove_client(&mut self, id: ClientId) -> Option<Box<dyn WireConnection>> {
        if id == LOCAL_CLIENT {
            return None;
        }
        self.clients.get(id)?;
        self.storage.remove_client(&mut self.clients, id);
        let client = self.clients.remove(id)?;
        info!("client {} disconnected", client.name());
        client.into_wire()
    }

    pub fn process_incoming_text(&mut self, id: ClientId, data: &str) -> bool {
        match self.clients.get(id).map(|c| &c.kind) {
            Some(SessionKind::V4(_)) => {
                nt4::process_incoming_text(&mut self.storage, &mut self.clients, id, data)
            }
            _ => false,
        }
    }

    /// Returns true if the client has input waiting in its backlog.
    pub fn process_incoming_binary(&mut self, id: ClientId, data: &[u8]) -> bool {
        match self.clients.get(id).map(|c| &c.kind) {
            Some(SessionKind::V4(_)) => {
                nt4::process_incoming_binary(&mut self.storage, &mut self.clients, id, data)
            }
            Some(SessionKind::V3(_)) => {
                nt3::process_incoming_binary(&mut self.storage, &mut self.clients, id, data)
            }
            _ => false,
        }
    }

    /// Work through deferred incoming values, at most `max` per client.
    /// Returns true if any client still has some left.
    pub fn process_incoming_messages(&mut self, max: usize) -> bool {
        let ids: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| matches!(&c.kind, SessionKind::V4(s) if s.backlog() > 0))
            .map(ClientData::id)
            .collect();
        let mut remaining = false;
        for id in ids {
            remaining |= nt4::process_backlog(&mut self.storage, &mut self.clients, id, max);
        }
        remaining
    }

    /// Apply requests from the local client.
    pub fn handle_local(&mut self, requests: Vec<LocalRequest>) {
        let mut handler = Nt4Handler::new(&mut self.storage, &mut self.clients, LOCAL_CLIENT);
        for request in requests {
            match request {
                LocalRequest::Control(msg) => handler.handle(msg),
                LocalRequest::SetValue { pubuid, value } => {
                    handler.client_set_value(pubuid, &value)
                }
            }
        }
    }

    /// Drive every client's outgoing data. Without `flush` a client is only
    /// visited once per its subscriber period.
    pub fn send_all_outgoing(&mut self, now_ms: u64, flush: bool) {
        for client in self.clients.iter_mut() {
            if flush || client.periodic_due(now_ms) {
                client.send_outgoing(now_ms, flush);
            }
        }
    }

    pub fn send_outgoing(&mut self, id: ClientId, now_ms: u64) {
        if let Some(client) = self.clients.get_mut(id) {
            client.send_outgoing(now_ms, false);
        }
    }

    /// Republish `$clients`.
    pub fn connections_changed(&mut self, conns: &[ConnectionInfo]) {
        let infos: Vec<ClientInfo> = conns
            .iter()
            .map(|c| ClientInfo {
                id: c.remote_id.clone(),
                conn: format!("{}:{}", c.remote_ip, c.remote_port),
                ver: c.protocol_version,
            })
            .collect();
        self.storage
            .update_meta_clients(&mut self.clients, self.meta_clients, &infos);
    }

    /// True once after any persistent topic changed.
    pub fn persistent_changed(&mut self) -> bool {
        self.storage.take_persistent_changed()
    }

    /// Flag persistent topics as unsaved, e.g. after a failed save.
    pub fn mark_persistent_changed(&mut self) {
        self.storage.mark_persistent_changed();
    }

    pub fn dump_persistent(&self) -> String {
        self.storage.dump_persistent()
    }

    /// Returns accumulated load errors; empty on success.
    pub fn load_persistent(&mut self, input: &str) -> String {
        self.storage.load_persistent(&mut self.clients, input)
    }

    /// Convenience for the local side: publish a topic with no properties.
    pub fn local_publish(&mut self, pubuid: i64, name: &str, type_str: &str) {
        let mut handler = Nt4Handler::new(&mut self.storage, &mut self.clients, LOCAL_CLIENT);
        handler.client_publish(pubuid, name, type_str, &Map::new());
    }

    /// Background driver: drains backlogs and sends due outgoing data every
    /// `tick_ms`.
    pub async fn start_periodic_loop(server: SharedServer, tick_ms: u64) {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_millis(tick_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let mut server = lock(&server);
            if server.process_incoming_messages(Self::MAX_BACKLOG_BATCH) {
                debug!("incoming backlog remains after tick");
            }
            server.send_all_outgoing(now_millis(), false);
        }
    }
}
