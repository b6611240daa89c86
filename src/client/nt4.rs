//! NT4 sessions and the client message handler.
//!
//! `Nt4Handler` applies publish/subscribe requests to storage on behalf of
//! one client. It serves both NT4 WebSocket clients and the local client.
//! `Session4` is the per-connection state: the wire, the outgoing queue, the
//! set of topics announced so far and the backlog of incoming values.

use std::collections::{HashSet, VecDeque};

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::broker::storage::ServerStorage;
use crate::broker::topic::{ServerTopic, TopicId, ValueSendMode};
use crate::broker::value::Value;
use crate::client::outgoing::NetworkOutgoingQueue;
use crate::client::{
    ClientData, ClientId, ClientTable, PubSubOptions, PublisherData, SessionKind, SubscriberData,
};
use crate::transport::codec::{PING_ID, ValueFrame, decode_frames, encode_frame};
use crate::transport::message::{ClientMessage, ServerMessage, decode_client_messages};
use crate::transport::wire::WireConnection;
use crate::utils::time::now_micros;

/// Values applied straight from a binary frame before the rest is deferred.
pub const MAX_INLINE_VALUES: usize = 10;

pub struct Session4 {
    wire: Box<dyn WireConnection>,
    outgoing: NetworkOutgoingQueue,
    announced: HashSet<TopicId>,
    incoming: VecDeque<ValueFrame>,
    local: bool,
}

impl Session4 {
    pub fn new(wire: Box<dyn WireConnection>, local: bool) -> Self {
        Self {
            wire,
            outgoing: NetworkOutgoingQueue::new(local),
            announced: HashSet::new(),
            incoming: VecDeque::new(),
            local,
        }
    }

    pub fn wire_mut(&mut self) -> &mut dyn WireConnection {
        &mut *self.wire
    }

    pub fn into_wire(self) -> Box<dyn WireConnection> {
        self.wire
    }

    pub fn outgoing(&self) -> &NetworkOutgoingQueue {
        &self.outgoing
    }

    /// Values waiting to be applied.
    pub fn backlog(&self) -> usize {
        self.incoming.len()
    }

    pub fn set_period(&mut self, topic: TopicId, period_ms: u32) {
        self.outgoing.set_period(topic, period_ms);
    }

    fn send_control(&mut self, topic: TopicId, msg: ServerMessage) {
        if !self.local {
            self.outgoing.send_message(topic, msg);
            return;
        }
        match serde_json::to_string(&msg) {
            Ok(text) => {
                if let Err(e) = self.wire.write_text(text).and_then(|_| self.wire.flush()) {
                    debug!("write failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode control message: {e}"),
        }
    }

    pub fn send_announce(&mut self, topic: &ServerTopic, pubuid: Option<i64>) {
        // a repeat announce only goes out to acknowledge a publish
        if !self.announced.insert(topic.id) && pubuid.is_none() {
            return;
        }
        self.send_control(
            topic.id,
            ServerMessage::Announce {
                name: topic.name.clone(),
                id: i64::from(topic.id),
                type_str: topic.type_str.clone(),
                pubuid,
                properties: topic.properties.clone(),
            },
        );
    }

    pub fn send_unannounce(&mut self, topic: &ServerTopic) {
        if !self.announced.remove(&topic.id) {
            return;
        }
        self.send_control(
            topic.id,
            ServerMessage::Unannounce {
                name: topic.name.clone(),
                id: i64::from(topic.id),
            },
        );
        self.outgoing.forget_value(topic.id);
    }

    pub fn send_properties_update(&mut self, topic: &ServerTopic, update: &JsonValue, ack: bool) {
        if !self.announced.contains(&topic.id) {
            return;
        }
        self.send_control(
            topic.id,
            ServerMessage::Properties {
                name: topic.name.clone(),
                update: update.clone(),
                ack,
            },
        );
    }

    pub fn send_value(&mut self, topic: &ServerTopic, value: &Value, mode: ValueSendMode) {
        self.outgoing.send_value(&mut *self.wire, topic.id, value, mode);
    }

    pub fn send_outgoing(&mut self, now_ms: u64, flush: bool) {
        self.outgoing.send_outgoing(&mut *self.wire, now_ms, flush);
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.wire.flush() {
            debug!("flush failed: {e}");
        }
    }

    /// Answer a time-sync ping with the server's clock.
    fn reply_ping(&mut self, value: Value) {
        let reply = Value::new(value.data, now_micros());
        match encode_frame(PING_ID, &reply) {
            Ok(frame) => {
                if let Err(e) = self.wire.write_binary(frame).and_then(|_| self.wire.flush()) {
                    debug!("ping reply failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode ping reply: {e}"),
        }
    }
}

/// Applies client requests to storage for one client.
pub struct Nt4Handler<'a> {
    storage: &'a mut ServerStorage,
    clients: &'a mut ClientTable,
    id: ClientId,
}

impl<'a> Nt4Handler<'a> {
    pub fn new(storage: &'a mut ServerStorage, clients: &'a mut ClientTable, id: ClientId) -> Self {
        Self {
            storage,
            clients,
            id,
        }
    }

    pub fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Publish {
                name,
                pubuid,
                type_str,
                properties,
            } => self.client_publish(pubuid, &name, &type_str, &properties),
            ClientMessage::Unpublish { pubuid } => self.client_unpublish(pubuid),
            ClientMessage::SetProperties { name, update } => {
                self.client_set_properties(&name, &update)
            }
            ClientMessage::Subscribe {
                topics,
                subuid,
                options,
            } => self.client_subscribe(subuid, topics, PubSubOptions::from(&options)),
            ClientMessage::Unsubscribe { subuid } => self.client_unsubscribe(subuid),
        }
    }

    pub fn client_publish(
        &mut self,
        pubuid: i64,
        name: &str,
        type_str: &str,
        properties: &Map<String, JsonValue>,
    ) {
        let Some(client) = self.clients.get(self.id) else {
            return;
        };
        if client.publishers.contains_key(&pubuid) {
            warn!("client {} duplicate publish of pubuid {pubuid}", client.name());
            return;
        }

        let topic_id =
            self.storage
                .create_topic(self.clients, Some(self.id), name, type_str, properties, false);

        let (Some(client), Some(topic)) = (
            self.clients.get_mut(self.id),
            self.storage.get_topic_mut(topic_id),
        ) else {
            return;
        };
        client
            .publishers
            .insert(pubuid, PublisherData { pubuid, topic: topic_id });
        topic.add_publisher(self.id, pubuid);
        client.send_announce(topic, Some(pubuid));

        self.storage.update_meta_topic_pub(self.clients, topic_id);
        self.storage.update_meta_client_pub(self.clients, self.id);
    }

    pub fn client_unpublish(&mut self, pubuid: i64) {
        let Some(client) = self.clients.get_mut(self.id) else {
            return;
        };
        let Some(publisher) = client.publishers.remove(&pubuid) else {
            debug!("client {} unpublish of unknown pubuid {pubuid}", client.name());
            return;
        };
        let topic_id = publisher.topic;
        let Some(topic) = self.storage.get_topic_mut(topic_id) else {
            return;
        };
        topic.remove_publisher(self.id, pubuid);
        let published = topic.is_published();

        self.storage.update_meta_topic_pub(self.clients, topic_id);
        self.storage.update_meta_client_pub(self.clients, self.id);

        if !published {
            self.storage.delete_topic(self.clients, topic_id);
        }
    }

    pub fn client_set_properties(&mut self, name: &str, update: &JsonValue) {
        let Some(topic_id) = self.storage.find_topic(name) else {
            debug!("setproperties on unknown topic '{name}'");
            return;
        };
        let Some(topic) = self.storage.get_topic(topic_id) else {
            return;
        };
        if topic.special {
            debug!("ignored setproperties on meta topic '{name}'");
            return;
        }
        if !topic.is_published() {
            return;
        }
        self.storage
            .set_properties(self.clients, Some(self.id), topic_id, update);
    }

    pub fn client_subscribe(
        &mut self,
        subuid: i64,
        topic_names: Vec<String>,
        options: PubSubOptions,
    ) {
        let sub = SubscriberData::new(subuid, topic_names, options);
        let replace = {
            let Some(client) = self.clients.get_mut(self.id) else {
                return;
            };
            let replace = client.subscribers.insert(subuid, sub.clone()).is_some();
            if replace {
                client.recompute_period();
            } else {
                client.add_period(sub.period_ms);
            }
            replace
        };

        for topic_id in self.storage.topic_ids() {
            let (added, removed) = {
                let (Some(topic), Some(client)) = (
                    self.storage.get_topic_mut(topic_id),
                    self.clients.get_mut(self.id),
                ) else {
                    continue;
                };

                let tcd = topic.clients.entry(self.id).or_default();
                let removed = replace && tcd.subscribers.remove(&subuid);
                let was_subscribed = !tcd.subscribers.is_empty();
                let added = sub.matches(&topic.name, topic.special)
                    && tcd.add_subscriber(subuid, &sub.options);
                if added || removed {
                    tcd.refresh_send_mode(&client.subscribers);
                }
                let snapshot = tcd.clone();
                if snapshot.is_empty() {
                    topic.clients.remove(&self.id);
                }

                if added {
                    client.update_period(topic_id, &snapshot);
                }
                if added && !removed && !was_subscribed {
                    client.send_announce(topic, None);
                    if !sub.options.topics_only {
                        if let Some(value) = &topic.last_value {
                            client.send_value(topic, value, ValueSendMode::All);
                        }
                    }
                }
                (added, removed)
            };

            if added != removed {
                self.storage.update_meta_topic_sub(self.clients, topic_id);
            }
        }

        self.storage.update_meta_client_sub(self.clients, self.id);
        if let Some(client) = self.clients.get_mut(self.id) {
            client.flush();
        }
    }

    pub fn client_unsubscribe(&mut self, subuid: i64) {
        {
            let Some(client) = self.clients.get_mut(self.id) else {
                return;
            };
            if client.subscribers.remove(&subuid).is_none() {
                debug!("client {} unsubscribe of unknown subuid {subuid}", client.name());
                return;
            }
            client.recompute_period();
        }

        for topic_id in self.storage.topic_ids() {
            let changed = {
                let (Some(topic), Some(client)) = (
                    self.storage.get_topic_mut(topic_id),
                    self.clients.get_mut(self.id),
                ) else {
                    continue;
                };
                let Some(tcd) = topic.clients.get_mut(&self.id) else {
                    continue;
                };
                if !tcd.subscribers.remove(&subuid) {
                    continue;
                }
                tcd.refresh_send_mode(&client.subscribers);
                let snapshot = tcd.clone();
                if snapshot.is_empty() {
                    topic.clients.remove(&self.id);
                }
                client.update_period(topic_id, &snapshot);
                true
            };
            if changed {
                self.storage.update_meta_topic_sub(self.clients, topic_id);
            }
        }

        self.storage.update_meta_client_sub(self.clients, self.id);
    }

    pub fn client_set_value(&mut self, pubuid: i64, value: &Value) {
        let topic_id = self
            .clients
            .get(self.id)
            .and_then(|c| c.publishers.get(&pubuid))
            .map(|p| p.topic);
        let Some(topic_id) = topic_id else {
            debug!("value for unknown pubuid {pubuid}");
            return;
        };
        self.storage
            .set_value(self.clients, Some(self.id), topic_id, value);
    }
}

fn session4(clients: &mut ClientTable, id: ClientId) -> Option<&mut Session4> {
    match &mut clients.get_mut(id)?.kind {
        SessionKind::V4(session) => Some(session),
        _ => None,
    }
}

/// Handle one text frame. A frame that is not valid JSON (or not an array)
/// disconnects the client.
pub fn process_incoming_text(
    storage: &mut ServerStorage,
    clients: &mut ClientTable,
    id: ClientId,
    data: &str,
) -> bool {
    match decode_client_messages(data) {
        Ok(msgs) => {
            let mut handler = Nt4Handler::new(storage, clients, id);
            for msg in msgs {
                handler.handle(msg);
            }
        }
        Err(e) => {
            if let Some(wire) = clients.get_mut(id).and_then(ClientData::wire_mut) {
                wire.disconnect(&e.to_string());
            }
        }
    }
    false
}

/// Handle one binary frame. Pings are answered right away; the first few
/// values are applied inline and the rest wait in the session backlog with
/// reading paused. Returns true if a backlog remains.
pub fn process_incoming_binary(
    storage: &mut ServerStorage,
    clients: &mut ClientTable,
    id: ClientId,
    data: &[u8],
) -> bool {
    let (frames, error) = decode_frames(data);
    let mut inline = Vec::new();
    let queued = {
        let Some(session) = session4(clients, id) else {
            return false;
        };
        for frame in frames {
            if frame.id == PING_ID {
                session.reply_ping(frame.value);
            } else if session.incoming.is_empty() && inline.len() < MAX_INLINE_VALUES {
                inline.push(frame);
            } else {
                session.incoming.push_back(frame);
            }
        }
        if let Some(e) = &error {
            session.wire.disconnect(&e.to_string());
        }
        let queued = !session.incoming.is_empty();
        if queued {
            session.wire.stop_read();
        }
        queued
    };

    let mut handler = Nt4Handler::new(storage, clients, id);
    for frame in inline {
        handler.client_set_value(frame.id, &frame.value);
    }
    queued
}

/// Apply up to `max` backlogged values. Reading resumes once the backlog is
/// empty. Returns true if values remain.
pub fn process_backlog(
    storage: &mut ServerStorage,
    clients: &mut ClientTable,
    id: ClientId,
    max: usize,
) -> bool {
    let batch: Vec<ValueFrame> = {
        let Some(session) = session4(clients, id) else {
            return false;
        };
        if session.incoming.is_empty() {
            return false;
        }
        let n = max.min(session.incoming.len());
        session.incoming.drain(..n).collect()
    };

    let mut handler = Nt4Handler::new(storage, clients, id);
    for frame in batch {
        handler.client_set_value(frame.id, &frame.value);
    }

    let Some(session) = session4(clients, id) else {
        return false;
    };
    if session.incoming.is_empty() {
        session.wire.start_read();
        false
    } else {
        true
    }
}
