//! The `client` module defines the server-side view of a connected client.
//!
//! A `ClientData` carries what every protocol has in common (identity,
//! publishers, subscribers, meta topics) and a `SessionKind` with the
//! protocol-specific half: the in-process local client, an NT4 WebSocket
//! session or an NT3 TCP session. Clients live in a `ClientTable` and are
//! addressed by slot index; slot 0 is always the local client.

pub mod local;
pub mod nt3;
pub mod nt4;
pub mod outgoing;

use std::collections::{BTreeMap, HashMap};

use serde_json::Value as JsonValue;

use crate::broker::topic::{ServerTopic, TopicClientData, TopicId, ValueSendMode};
use crate::broker::value::Value;
use crate::transport::wire::WireConnection;

pub use local::{LocalEvent, LocalRequest, LocalSession};
pub use nt3::Session3;
pub use nt4::Session4;
use outgoing::{DEFAULT_PERIOD_MS, MIN_PERIOD_MS, gcd};

pub type ClientId = usize;

/// Slot the in-process client always occupies.
pub const LOCAL_CLIENT: ClientId = 0;

/// Per-subscriber options.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubOptions {
    /// Send period in seconds.
    pub periodic: f64,
    pub send_all: bool,
    pub topics_only: bool,
    pub prefix_match: bool,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            periodic: 0.1,
            send_all: false,
            topics_only: false,
            prefix_match: false,
        }
    }
}

impl PubSubOptions {
    /// Period in milliseconds, rounded to 10 ms and floored at the minimum.
    pub fn period_ms(&self) -> u32 {
        let tens = (self.periodic * 100.0).round();
        if !tens.is_finite() || tens <= 0.0 {
            return MIN_PERIOD_MS;
        }
        ((tens as u64).saturating_mul(10).min(u64::from(u32::MAX)) as u32).max(MIN_PERIOD_MS)
    }
}

#[derive(Debug, Clone)]
pub struct PublisherData {
    pub pubuid: i64,
    pub topic: TopicId,
}

#[derive(Debug, Clone)]
pub struct SubscriberData {
    pub subuid: i64,
    pub topic_names: Vec<String>,
    pub options: PubSubOptions,
    pub period_ms: u32,
}

impl SubscriberData {
    pub fn new(subuid: i64, topic_names: Vec<String>, options: PubSubOptions) -> Self {
        let period_ms = options.period_ms();
        Self {
            subuid,
            topic_names,
            options,
            period_ms,
        }
    }

    /// Whether a topic name is selected by this subscription. Special
    /// topics are only reachable by exact name or a non-empty prefix.
    pub fn matches(&self, name: &str, special: bool) -> bool {
        self.topic_names.iter().any(|pattern| {
            name == pattern
                || (self.options.prefix_match
                    && name.starts_with(pattern.as_str())
                    && (!special || !pattern.is_empty()))
        })
    }
}

pub enum SessionKind {
    Local(LocalSession),
    V4(Session4),
    V3(Session3),
}

pub struct ClientData {
    id: ClientId,
    name: String,
    original_name: String,
    conn_info: String,
    local: bool,
    period_ms: Option<u32>,
    next_periodic_ms: u64,
    pub publishers: HashMap<i64, PublisherData>,
    pub subscribers: BTreeMap<i64, SubscriberData>,
    pub meta_pub: Option<TopicId>,
    pub meta_sub: Option<TopicId>,
    pub kind: SessionKind,
}

impl ClientData {
    pub fn new(
        id: ClientId,
        original_name: &str,
        name: &str,
        conn_info: &str,
        local: bool,
        kind: SessionKind,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            original_name: original_name.to_string(),
            conn_info: conn_info.to_string(),
            local,
            period_ms: None,
            next_periodic_ms: 0,
            publishers: HashMap::new(),
            subscribers: BTreeMap::new(),
            meta_pub: None,
            meta_sub: None,
            kind,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn conn_info(&self) -> &str {
        &self.conn_info
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// GCD of every subscriber period; `None` until something subscribes.
    pub fn period_ms(&self) -> Option<u32> {
        self.period_ms
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.original_name = name.clone();
        self.name = name;
    }

    /// Fold a new subscriber period into the client-wide period.
    pub(crate) fn add_period(&mut self, period_ms: u32) {
        let period = match self.period_ms {
            None => period_ms,
            Some(current) => gcd(current, period_ms),
        };
        self.period_ms = Some(period.max(MIN_PERIOD_MS));
    }

    /// Recompute the client-wide period from scratch.
    pub(crate) fn recompute_period(&mut self) {
        self.period_ms = self
            .subscribers
            .values()
            .map(|s| s.period_ms)
            .reduce(gcd)
            .map(|p| p.max(MIN_PERIOD_MS));
    }

    /// True when the client-wide period has passed since the last periodic
    /// send, and starts the next period. Clients without subscribers are
    /// always due.
    pub(crate) fn periodic_due(&mut self, now_ms: u64) -> bool {
        let Some(period) = self.period_ms else {
            return true;
        };
        if now_ms < self.next_periodic_ms {
            return false;
        }
        self.next_periodic_ms = now_ms + u64::from(period);
        true
    }

    /// Subscribers of this client that select the given topic.
    pub fn matching_subscribers(&self, name: &str, special: bool) -> Vec<i64> {
        self.subscribers
            .values()
            .filter(|sub| sub.matches(name, special))
            .map(|sub| sub.subuid)
            .collect()
    }

    /// Point the outgoing queue for `topic` at the period its attached
    /// subscribers ask for.
    pub fn update_period(&mut self, topic: TopicId, tcd: &TopicClientData) {
        let period = tcd
            .subscribers
            .iter()
            .filter_map(|uid| self.subscribers.get(uid))
            .map(|sub| sub.period_ms)
            .reduce(gcd)
            .unwrap_or(DEFAULT_PERIOD_MS);
        if let SessionKind::V4(session) = &mut self.kind {
            session.set_period(topic, period);
        }
    }

    pub fn send_announce(&mut self, topic: &ServerTopic, pubuid: Option<i64>) {
        match &mut self.kind {
            SessionKind::Local(s) => s.send_announce(topic, pubuid),
            SessionKind::V4(s) => s.send_announce(topic, pubuid),
            // NT3 has no announce; the first value becomes an entry assign
            SessionKind::V3(_) => {}
        }
    }

    pub fn send_unannounce(&mut self, topic: &ServerTopic) {
        match &mut self.kind {
            SessionKind::Local(s) => s.send_unannounce(topic),
            SessionKind::V4(s) => s.send_unannounce(topic),
            SessionKind::V3(s) => s.send_unannounce(topic),
        }
    }

    pub fn send_properties_update(&mut self, topic: &ServerTopic, update: &JsonValue, ack: bool) {
        match &mut self.kind {
            SessionKind::Local(s) => s.send_properties_update(topic, update, ack),
            SessionKind::V4(s) => s.send_properties_update(topic, update, ack),
            SessionKind::V3(s) => s.send_properties_update(topic, ack),
        }
    }

    pub fn send_value(&mut self, topic: &ServerTopic, value: &Value, mode: ValueSendMode) {
        match &mut self.kind {
            SessionKind::Local(s) => s.send_value(topic, value, mode),
            SessionKind::V4(s) => s.send_value(topic, value, mode),
            SessionKind::V3(s) => s.send_value(topic, value, mode),
        }
    }

    pub fn send_outgoing(&mut self, now_ms: u64, flush: bool) {
        match &mut self.kind {
            SessionKind::Local(_) => {}
            SessionKind::V4(s) => s.send_outgoing(now_ms, flush),
            SessionKind::V3(s) => s.send_outgoing(now_ms),
        }
    }

    pub fn flush(&mut self) {
        match &mut self.kind {
            SessionKind::Local(_) => {}
            SessionKind::V4(s) => s.flush(),
            SessionKind::V3(s) => s.flush(),
        }
    }

    pub fn wire_mut(&mut self) -> Option<&mut dyn WireConnection> {
        match &mut self.kind {
            SessionKind::Local(_) => None,
            SessionKind::V4(s) => Some(s.wire_mut()),
            SessionKind::V3(s) => Some(s.wire_mut()),
        }
    }

    pub fn into_wire(self) -> Option<Box<dyn WireConnection>> {
        match self.kind {
            SessionKind::Local(_) => None,
            SessionKind::V4(s) => Some(s.into_wire()),
            SessionKind::V3(s) => Some(s.into_wire()),
        }
    }
}

/// Slot-indexed client storage. Freed slots are reused.
#[derive(Default)]
pub struct ClientTable {
    slots: Vec<Option<ClientData>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientData> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientData> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Place a client in the first free slot; `make` receives the slot id.
    pub fn insert_with(&mut self, make: impl FnOnce(ClientId) -> ClientData) -> ClientId {
        let id = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len());
        let client = make(id);
        if id == self.slots.len() {
            self.slots.push(Some(client));
        } else {
            self.slots[id] = Some(client);
        }
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientData> {
        self.slots.get_mut(id)?.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientData> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientData> {
        self.slots.iter_mut().flatten()
    }

    /// Display name for meta records; empty for unknown slots.
    pub fn name(&self, id: ClientId) -> &str {
        self.get(id).map_or("", ClientData::name)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests;
