//! NT3 sessions.
//!
//! An NT3 client goes through `Initial -> ServerHelloComplete -> Running`.
//! Entries map one-to-one onto topics; the topic id is the entry id. NT3
//! has no subscribe message, so every NT3 client gets a single implicit
//! subscriber (uid 0) on the empty prefix, and the first value sent for a
//! topic goes out as an entry assign instead of an announce.

use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, info, warn};

use crate::broker::storage::ServerStorage;
use crate::broker::topic::{NT_PERSISTENT, ServerTopic, TopicId, ValueSendMode};
use crate::broker::value::Value;
use crate::client::outgoing::MIN_PERIOD_MS;
use crate::client::{
    ClientId, ClientTable, PubSubOptions, PublisherData, SessionKind, SubscriberData,
};
use crate::transport::wire::WireConnection;
use crate::transport::wire3::{
    FLAG_PERSISTENT, Message3, PROTO_REV, UNASSIGNED_ID, WireDecoder3, encode_all,
};
use crate::utils::time::now_micros;

/// A connection that cannot drain its output for this long is dropped.
pub const STALL_TIMEOUT_US: i64 = 1_000_000;

/// Called once the client hello completes, with the client's slot, its
/// name and the protocol revision.
pub type Connected3Fn = Box<dyn FnOnce(ClientId, &str, u16) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State3 {
    Initial,
    ServerHelloComplete,
    Running,
}

#[derive(Debug, Clone, Default)]
struct TopicData3 {
    flags: u8,
    seq_num: u16,
    sent_assign: bool,
    published: bool,
    pubuid: i64,
}

impl TopicData3 {
    fn new(topic: &ServerTopic) -> Self {
        Self {
            flags: flags3(topic),
            ..Self::default()
        }
    }
}

fn flags3(topic: &ServerTopic) -> u8 {
    if topic.persistent { FLAG_PERSISTENT } else { 0 }
}

/// NT3 entry ids are 16 bits wide and 0xFFFF means unassigned, so topics
/// past that range cannot be shown to NT3 clients.
fn entry_id(topic: TopicId) -> Option<u16> {
    u16::try_from(topic).ok().filter(|&id| id != UNASSIGNED_ID)
}

pub struct Session3 {
    wire: Box<dyn WireConnection>,
    decoder: WireDecoder3,
    state: State3,
    topics3: HashMap<TopicId, TopicData3>,
    outgoing: Vec<Message3>,
    outgoing_values: HashMap<TopicId, usize>,
    next_pubuid: i64,
    last_send_ms: u64,
    local: bool,
    connected: Option<Connected3Fn>,
}

impl Session3 {
    pub fn new(
        wire: Box<dyn WireConnection>,
        local: bool,
        connected: Option<Connected3Fn>,
    ) -> Self {
        Self {
            wire,
            decoder: WireDecoder3::default(),
            state: State3::Initial,
            topics3: HashMap::new(),
            outgoing: Vec::new(),
            outgoing_values: HashMap::new(),
            next_pubuid: 1,
            last_send_ms: 0,
            local,
            connected,
        }
    }

    pub fn state(&self) -> State3 {
        self.state
    }

    pub fn decoder(&self) -> &WireDecoder3 {
        &self.decoder
    }

    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }

    pub fn wire_mut(&mut self) -> &mut dyn WireConnection {
        &mut *self.wire
    }

    pub fn into_wire(self) -> Box<dyn WireConnection> {
        self.wire
    }

    fn topic3(&mut self, topic: &ServerTopic) -> &mut TopicData3 {
        self.topics3
            .entry(topic.id)
            .or_insert_with(|| TopicData3::new(topic))
    }

    fn write_now(&mut self, msgs: &[Message3]) {
        let buf = encode_all(msgs);
        if let Err(e) = self.wire.write_binary(buf).and_then(|_| self.wire.flush()) {
            debug!("write failed: {e}");
        }
    }

    /// Control messages skip the queue only for a running local client.
    fn send_control(&mut self, msg: Message3) {
        if self.local && self.state == State3::Running {
            self.write_now(&[msg]);
        } else {
            self.outgoing.push(msg);
        }
    }

    pub fn send_value(&mut self, topic: &ServerTopic, value: &Value, mut mode: ValueSendMode) {
        if mode == ValueSendMode::Disabled {
            return;
        }
        if self.local && self.state == State3::Running {
            mode = ValueSendMode::Imm;
        } else if self.state != State3::Running && mode == ValueSendMode::Imm {
            mode = ValueSendMode::All;
        }

        let Some(id) = entry_id(topic.id) else {
            debug!("topic '{}' id {} does not fit an NT3 entry id", topic.name, topic.id);
            return;
        };
        let topic3 = self.topic3(topic);
        let msg = if topic3.sent_assign {
            topic3.seq_num = topic3.seq_num.wrapping_add(1);
            Message3::EntryUpdate {
                id,
                seq_num: topic3.seq_num,
                value: value.clone(),
            }
        } else {
            topic3.sent_assign = true;
            Message3::EntryAssign {
                name: topic.name.clone(),
                id,
                seq_num: topic3.seq_num,
                flags: topic3.flags,
                value: value.clone(),
            }
        };

        match mode {
            ValueSendMode::Imm => self.write_now(&[msg]),
            ValueSendMode::Normal => {
                if let Some(&index) = self.outgoing_values.get(&topic.id) {
                    if let Some(slot) = self.outgoing.get_mut(index) {
                        match (slot, msg) {
                            // keep a pending assign, just refresh its value
                            (
                                Message3::EntryAssign { value: pending, .. },
                                Message3::EntryUpdate { value, .. },
                            ) => *pending = value,
                            (slot, msg) => *slot = msg,
                        }
                        return;
                    }
                }
                self.outgoing_values.insert(topic.id, self.outgoing.len());
                self.outgoing.push(msg);
            }
            ValueSendMode::All | ValueSendMode::Disabled => {
                self.outgoing_values.insert(topic.id, self.outgoing.len());
                self.outgoing.push(msg);
            }
        }
    }

    pub fn send_unannounce(&mut self, topic: &ServerTopic) {
        let Some(topic3) = self.topics3.remove(&topic.id) else {
            return;
        };
        self.outgoing_values.remove(&topic.id);
        if let (true, Some(id)) = (topic3.sent_assign, entry_id(topic.id)) {
            self.send_control(Message3::EntryDelete { id });
        }
    }

    pub fn send_properties_update(&mut self, topic: &ServerTopic, ack: bool) {
        if ack {
            return;
        }
        let Some(topic3) = self.topics3.get_mut(&topic.id) else {
            return;
        };
        let flags = flags3(topic);
        if topic3.flags == flags {
            return;
        }
        topic3.flags = flags;
        if let (true, Some(id)) = (topic3.sent_assign, entry_id(topic.id)) {
            self.send_control(Message3::FlagsUpdate { id, flags });
        }
    }

    /// Write everything queued. Only running sessions send; a wire that stays
    /// unwritable past the stall timeout is disconnected.
    pub fn send_outgoing(&mut self, now_ms: u64) {
        if self.outgoing.is_empty() || self.state != State3::Running {
            return;
        }
        if now_ms < self.last_send_ms + u64::from(MIN_PERIOD_MS) {
            return;
        }
        if !self.wire.ready() {
            let last = self.wire.last_flush_time();
            let now_us = (now_ms as i64).saturating_mul(1000);
            if last != 0 && now_us > last + STALL_TIMEOUT_US {
                self.wire.disconnect("transmit stalled");
            }
            return;
        }

        let msgs = std::mem::take(&mut self.outgoing);
        self.outgoing_values.clear();
        self.write_now(&msgs);
        self.last_send_ms = now_ms;
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.wire.flush() {
            debug!("flush failed: {e}");
        }
    }

    /// Send whatever the hello produced, then the hello-done marker.
    fn finish_handshake(&mut self) {
        let mut msgs = std::mem::take(&mut self.outgoing);
        self.outgoing_values.clear();
        msgs.push(Message3::ServerHelloDone);
        self.write_now(&msgs);
    }
}

fn session3(clients: &mut ClientTable, id: ClientId) -> Option<&mut Session3> {
    match &mut clients.get_mut(id)?.kind {
        SessionKind::V3(session) => Some(session),
        _ => None,
    }
}

/// Applies NT3 messages to storage for one client.
pub struct Nt3Handler<'a> {
    storage: &'a mut ServerStorage,
    clients: &'a mut ClientTable,
    id: ClientId,
}

impl<'a> Nt3Handler<'a> {
    pub fn new(storage: &'a mut ServerStorage, clients: &'a mut ClientTable, id: ClientId) -> Self {
        Self {
            storage,
            clients,
            id,
        }
    }

    fn session(&mut self) -> Option<&mut Session3> {
        session3(self.clients, self.id)
    }

    fn fail(&mut self, reason: &str) {
        if let Some(session) = self.session() {
            session.decoder.set_error(reason);
        }
    }

    /// True when the session is running; otherwise flags a protocol error.
    fn require_running(&mut self, what: &str) -> bool {
        let running = self
            .session()
            .is_some_and(|s| s.state == State3::Running);
        if !running {
            self.fail(&format!("received {what} before ClientHelloDone"));
        }
        running
    }

    fn has_error(&mut self) -> bool {
        self.session().is_none_or(|s| s.decoder.error().is_some())
    }

    pub fn handle(&mut self, msg: Message3) {
        match msg {
            Message3::KeepAlive => {
                self.require_running("KeepAlive");
            }
            Message3::ClientHello { proto_rev, self_id } => self.client_hello(proto_rev, &self_id),
            Message3::ClientHelloDone => self.client_hello_done(),
            Message3::ProtoUnsup { .. } => self.fail("received unexpected ProtoUnsup message"),
            Message3::ServerHello { .. } => self.fail("received unexpected ServerHello message"),
            Message3::ServerHelloDone => self.fail("received unexpected ServerHelloDone message"),
            // NT3 carries no timestamps; values count from when they arrive
            Message3::EntryAssign {
                name,
                id,
                flags,
                value,
                ..
            } => self.entry_assign(&name, id, flags, Value::new(value.data, now_micros())),
            Message3::EntryUpdate { id, seq_num, value } => {
                self.entry_update(id, seq_num, Value::new(value.data, now_micros()))
            }
            Message3::FlagsUpdate { id, flags } => self.flags_update(id, flags),
            Message3::EntryDelete { id } => self.entry_delete(id),
            Message3::ClearEntries => self.clear_entries(),
            Message3::ExecuteRpc { .. } | Message3::RpcResponse { .. } => {
                debug!("ignoring NT3 RPC message");
            }
        }
    }

    pub fn client_hello(&mut self, proto_rev: u16, self_id: &str) {
        let Some(session) = self.session() else {
            return;
        };
        if session.state != State3::Initial {
            self.fail("received unexpected ClientHello message");
            return;
        }
        if proto_rev != PROTO_REV {
            session.write_now(&[Message3::ProtoUnsup {
                proto_rev: PROTO_REV,
            }]);
            self.fail("unsupported protocol version");
            return;
        }

        let name = {
            let Some(client) = self.clients.get_mut(self.id) else {
                return;
            };
            let name = if self_id.is_empty() {
                format!("NT3@{}", client.conn_info())
            } else {
                format!("{self_id}-NT3@{}", client.conn_info())
            };
            client.set_name(name.clone());
            let options = PubSubOptions {
                prefix_match: true,
                ..PubSubOptions::default()
            };
            let sub = SubscriberData::new(0, vec![String::new()], options);
            client.add_period(sub.period_ms);
            client.subscribers.insert(0, sub);
            name
        };
        self.storage.create_client_meta_topics(self.clients, self.id);

        if let Some(session) = self.session() {
            session.write_now(&[Message3::ServerHello {
                flags: 0,
                self_id: "server".into(),
            }]);
        }

        let mut attached = Vec::new();
        for topic_id in self.storage.topic_ids() {
            let (Some(topic), Some(client)) = (
                self.storage.get_topic_mut(topic_id),
                self.clients.get_mut(self.id),
            ) else {
                continue;
            };
            if !topic.is_published() || topic.special {
                continue;
            }
            let tcd = topic.clients.entry(self.id).or_default();
            if let Some(sub) = client.subscribers.get(&0) {
                tcd.add_subscriber(0, &sub.options);
            }
            tcd.refresh_send_mode(&client.subscribers);
            if let Some(value) = &topic.last_value {
                client.send_value(topic, value, ValueSendMode::All);
            }
            attached.push(topic_id);
        }
        for topic_id in attached {
            self.storage.update_meta_topic_sub(self.clients, topic_id);
        }
        self.storage.update_meta_client_sub(self.clients, self.id);

        let Some(session) = self.session() else {
            return;
        };
        session.finish_handshake();
        session.state = State3::ServerHelloComplete;
        info!("NT3 client {name} connected");
        if let Some(connected) = session.connected.take() {
            connected(self.id, &name, PROTO_REV);
        }
    }

    fn client_hello_done(&mut self) {
        let Some(session) = self.session() else {
            return;
        };
        if session.state != State3::ServerHelloComplete {
            self.fail("received unexpected ClientHelloDone message");
            return;
        }
        session.state = State3::Running;
    }

    fn entry_assign(&mut self, name: &str, id: u16, flags: u8, value: Value) {
        if !self.require_running("EntryAssign") {
            return;
        }
        if id != UNASSIGNED_ID {
            debug!("ignoring EntryAssign for '{name}' with preassigned id {id}");
            return;
        }

        let mut properties = Map::new();
        properties.insert("retained".into(), json!(true));
        if flags & FLAG_PERSISTENT != 0 {
            properties.insert("persistent".into(), json!(true));
        }
        let topic_id = self.storage.create_topic(
            self.clients,
            Some(self.id),
            name,
            value.type_str(),
            &properties,
            false,
        );

        {
            let (Some(topic), Some(client)) = (
                self.storage.get_topic_mut(topic_id),
                self.clients.get_mut(self.id),
            ) else {
                return;
            };
            let SessionKind::V3(session) = &mut client.kind else {
                return;
            };
            let topic3 = session.topic3(topic);
            if topic3.published || topic3.sent_assign {
                warn!("ignoring duplicate EntryAssign of '{name}'");
                return;
            }
            let pubuid = session.next_pubuid;
            session.next_pubuid += 1;
            let topic3 = session.topic3(topic);
            topic3.published = true;
            topic3.pubuid = pubuid;
            client
                .publishers
                .insert(pubuid, PublisherData { pubuid, topic: topic_id });
            topic.add_publisher(self.id, pubuid);
        }
        self.storage.update_meta_topic_pub(self.clients, topic_id);
        self.storage.update_meta_client_pub(self.clients, self.id);

        self.storage
            .set_value(self.clients, Some(self.id), topic_id, &value);

        // tell the client which id it got
        let (Some(topic), Some(client)) = (
            self.storage.get_topic(topic_id),
            self.clients.get_mut(self.id),
        ) else {
            return;
        };
        let SessionKind::V3(session) = &mut client.kind else {
            return;
        };
        let Some(id) = entry_id(topic_id) else {
            debug!("topic '{name}' id {topic_id} does not fit an NT3 entry id");
            return;
        };
        let topic3 = session.topic3(topic);
        topic3.sent_assign = true;
        let msg = Message3::EntryAssign {
            name: topic.name.clone(),
            id,
            seq_num: topic3.seq_num,
            flags: topic3.flags,
            value,
        };
        session.send_control(msg);
    }

    fn entry_update(&mut self, id: u16, seq_num: u16, value: Value) {
        if !self.require_running("EntryUpdate") {
            return;
        }
        let topic_id = TopicId::from(id);
        let newly_published = {
            let (Some(topic), Some(client)) = (
                self.storage.get_topic_mut(topic_id),
                self.clients.get_mut(self.id),
            ) else {
                debug!("ignoring EntryUpdate for unknown id {id}");
                return;
            };
            if !topic.is_published() {
                debug!("ignoring EntryUpdate for unpublished id {id}");
                return;
            }
            let SessionKind::V3(session) = &mut client.kind else {
                return;
            };
            let next_pubuid = session.next_pubuid;
            let topic3 = session.topic3(topic);
            topic3.seq_num = seq_num;
            if topic3.published {
                false
            } else {
                topic3.published = true;
                topic3.pubuid = next_pubuid;
                session.next_pubuid += 1;
                client.publishers.insert(
                    next_pubuid,
                    PublisherData {
                        pubuid: next_pubuid,
                        topic: topic_id,
                    },
                );
                topic.add_publisher(self.id, next_pubuid);
                true
            }
        };
        if newly_published {
            self.storage.update_meta_topic_pub(self.clients, topic_id);
            self.storage.update_meta_client_pub(self.clients, self.id);
        }
        self.storage
            .set_value(self.clients, Some(self.id), topic_id, &value);
    }

    fn flags_update(&mut self, id: u16, flags: u8) {
        if !self.require_running("FlagsUpdate") {
            return;
        }
        let topic_id = TopicId::from(id);
        let Some(topic) = self.storage.get_topic(topic_id) else {
            debug!("ignoring FlagsUpdate for unknown id {id}");
            return;
        };
        if topic.special {
            return;
        }
        // NT3 only carries the persistent bit
        let mut mapped = topic.flags() & !NT_PERSISTENT;
        if flags & FLAG_PERSISTENT != 0 {
            mapped |= NT_PERSISTENT;
        }
        self.storage
            .set_flags(self.clients, Some(self.id), topic_id, mapped);
    }

    fn entry_delete(&mut self, id: u16) {
        if !self.require_running("EntryDelete") {
            return;
        }
        self.delete_entry(TopicId::from(id));
    }

    /// Forget every assign sent so far and drop this client's publishers.
    /// The topics stay; retained ones keep their value.
    fn clear_entries(&mut self) {
        if !self.require_running("ClearEntries") {
            return;
        }
        let ids: Vec<TopicId> = match self.session() {
            Some(session) => session
                .topics3
                .iter_mut()
                .map(|(id, topic3)| {
                    topic3.sent_assign = false;
                    *id
                })
                .collect(),
            None => return,
        };
        for topic_id in ids {
            self.unpublish_entry(topic_id);
        }
    }

    fn delete_entry(&mut self, topic_id: TopicId) {
        self.unpublish_entry(topic_id);

        // dropping retained deletes the topic once nobody publishes it
        if self.storage.get_topic(topic_id).is_some() {
            let update = JsonValue::Object(Map::from_iter([(
                "retained".to_string(),
                json!(false),
            )]));
            self.storage
                .set_properties(self.clients, None, topic_id, &update);
        }
    }

    fn unpublish_entry(&mut self, topic_id: TopicId) {
        let unpublished = {
            let (Some(topic), Some(client)) = (
                self.storage.get_topic_mut(topic_id),
                self.clients.get_mut(self.id),
            ) else {
                return;
            };
            let SessionKind::V3(session) = &mut client.kind else {
                return;
            };
            match session.topics3.get_mut(&topic_id) {
                Some(topic3) if topic3.published => {
                    topic3.published = false;
                    let pubuid = topic3.pubuid;
                    client.publishers.remove(&pubuid);
                    topic.remove_publisher(self.id, pubuid);
                    true
                }
                _ => false,
            }
        };
        if unpublished {
            self.storage.update_meta_topic_pub(self.clients, topic_id);
            self.storage.update_meta_client_pub(self.clients, self.id);
        }
    }
}

/// Handle bytes read from an NT3 connection. Protocol errors disconnect the
/// client with the decoder's error as the reason.
pub fn process_incoming_binary(
    storage: &mut ServerStorage,
    clients: &mut ClientTable,
    id: ClientId,
    data: &[u8],
) -> bool {
    let msgs = match session3(clients, id) {
        Some(session) => session.decoder.feed(data),
        None => return false,
    };

    let mut handler = Nt3Handler::new(storage, clients, id);
    for msg in msgs {
        handler.handle(msg);
        if handler.has_error() {
            break;
        }
    }

    if let Some(session) = session3(clients, id) {
        if let Some(reason) = session.decoder.error().map(ToString::to_string) {
            warn!("NT3 protocol error: {reason}");
            session.wire.disconnect(&reason);
        }
    }
    false
}
