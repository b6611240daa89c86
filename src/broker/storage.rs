//! Server topic storage
//!
//! `ServerStorage` owns every topic and enforces the table's rules:
//! - topics are created on first publish and live while published,
//!   persistent or retained
//! - the last value follows last-writer-wins by timestamp
//! - every regular topic has `$pub$`/`$sub$` meta topics mirroring who
//!   publishes and subscribes to it
//!
//! Anything that has to reach clients takes the `ClientTable` as an
//! argument; storage never holds onto clients. Announcing a new topic is
//! delegated to the coordinator through `AnnounceFn`, since deciding which
//! subscribers match is a client-side concern.

use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, warn};

use crate::broker::meta::{
    self, ClientInfo, ClientPublisher, ClientSubscriber, MetaOptions, TopicPublisher,
    TopicSubscriber,
};
use crate::broker::topic::{ServerTopic, TopicId, ValueSendMode};
use crate::broker::value::Value;
use crate::client::{ClientId, ClientTable};
use crate::persistence::json_store::{self, PersistentEntry};
use crate::utils::time::now_micros;

/// Announces a freshly created topic to matching clients, skipping the
/// creating client's announce (it gets one as part of its publish).
pub type AnnounceFn = fn(&mut ServerTopic, &mut ClientTable, Option<ClientId>);

pub struct ServerStorage {
    topics: Vec<Option<ServerTopic>>,
    free_ids: Vec<TopicId>,
    name_topics: HashMap<String, TopicId>,
    persistent_changed: bool,
    send_announce: AnnounceFn,
}

impl ServerStorage {
    pub fn new(send_announce: AnnounceFn) -> Self {
        Self {
            topics: Vec::new(),
            free_ids: Vec::new(),
            name_topics: HashMap::new(),
            persistent_changed: false,
            send_announce,
        }
    }

    pub fn get_topic(&self, id: TopicId) -> Option<&ServerTopic> {
        self.topics.get(id as usize)?.as_ref()
    }

    pub fn get_topic_mut(&mut self, id: TopicId) -> Option<&mut ServerTopic> {
        self.topics.get_mut(id as usize)?.as_mut()
    }

    pub fn find_topic(&self, name: &str) -> Option<TopicId> {
        self.name_topics.get(name).copied()
    }

    pub fn get_topic_by_name(&self, name: &str) -> Option<&ServerTopic> {
        self.get_topic(self.find_topic(name)?)
    }

    /// Ids of all live topics, in id order.
    pub fn topic_ids(&self) -> Vec<TopicId> {
        self.topics().map(|t| t.id).collect()
    }

    pub fn topics(&self) -> impl Iterator<Item = &ServerTopic> {
        self.topics.iter().flatten()
    }

    pub fn topic_count(&self) -> usize {
        self.name_topics.len()
    }

    /// Returns true once after any persistent topic changed.
    pub fn take_persistent_changed(&mut self) -> bool {
        std::mem::take(&mut self.persistent_changed)
    }

    pub fn mark_persistent_changed(&mut self) {
        self.persistent_changed = true;
    }

    fn alloc_id(&mut self) -> TopicId {
        match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.topics.push(None);
                (self.topics.len() - 1) as TopicId
            }
        }
    }

    /// Create a topic, or return the existing one of that name. An existing
    /// topic keeps its original type.
    pub fn create_topic(
        &mut self,
        clients: &mut ClientTable,
        client: Option<ClientId>,
        name: &str,
        type_str: &str,
        properties: &Map<String, JsonValue>,
        special: bool,
    ) -> TopicId {
        if let Some(id) = self.find_topic(name) {
            if let Some(topic) = self.get_topic(id) {
                if topic.type_str != type_str {
                    warn!(
                        "client {} publish '{name}' type mismatch: existing type is '{}', requested '{type_str}'",
                        client.map_or("server", |c| clients.name(c)),
                        topic.type_str
                    );
                }
            }
            return id;
        }

        let id = self.alloc_id();
        let mut topic = ServerTopic::new(id, name, type_str, properties.clone(), special);
        if topic.persistent {
            self.persistent_changed = true;
        }
        self.name_topics.insert(name.to_string(), id);

        if !special {
            topic.meta_pub = Some(self.create_meta_topic(clients, &meta::topic_pub_name(name)));
            topic.meta_sub = Some(self.create_meta_topic(clients, &meta::topic_sub_name(name)));
        }

        let slot = &mut self.topics[id as usize];
        let topic = slot.insert(topic);
        (self.send_announce)(topic, clients, client);

        if !special {
            self.update_meta_topic_pub(clients, id);
            self.update_meta_topic_sub(clients, id);
        }
        id
    }

    /// Meta topics are retained, typed `msgpack` and special.
    pub fn create_meta_topic(&mut self, clients: &mut ClientTable, name: &str) -> TopicId {
        let mut properties = Map::new();
        properties.insert("retained".into(), json!(true));
        self.create_topic(clients, None, name, meta::META_TYPE, &properties, true)
    }

    /// Create `$clientpub$<name>` and `$clientsub$<name>` for a client.
    pub fn create_client_meta_topics(&mut self, clients: &mut ClientTable, client: ClientId) {
        let Some(name) = clients.get(client).map(|c| c.name().to_string()) else {
            return;
        };
        let meta_pub = self.create_meta_topic(clients, &meta::client_pub_name(&name));
        let meta_sub = self.create_meta_topic(clients, &meta::client_sub_name(&name));
        if let Some(c) = clients.get_mut(client) {
            c.meta_pub = Some(meta_pub);
            c.meta_sub = Some(meta_sub);
        }
    }

    pub fn delete_topic(&mut self, clients: &mut ClientTable, id: TopicId) {
        let Some(topic) = self.topics.get_mut(id as usize).and_then(Option::take) else {
            return;
        };

        if let Some(meta_pub) = topic.meta_pub {
            self.delete_topic(clients, meta_pub);
        }
        if let Some(meta_sub) = topic.meta_sub {
            self.delete_topic(clients, meta_sub);
        }

        for (client_id, tcd) in &topic.clients {
            if tcd.subscribers.is_empty() {
                continue;
            }
            if let Some(client) = clients.get_mut(*client_id) {
                client.send_unannounce(&topic);
            }
        }

        if topic.persistent {
            self.persistent_changed = true;
        }
        self.name_topics.remove(&topic.name);
        self.free_ids.push(id);
        debug!("deleted topic '{}'", topic.name);
    }

    pub fn set_properties(
        &mut self,
        clients: &mut ClientTable,
        client: Option<ClientId>,
        id: TopicId,
        update: &JsonValue,
    ) {
        let Some(topic) = self.get_topic_mut(id) else {
            return;
        };
        let was_persistent = topic.persistent;
        if !topic.set_properties(update) {
            return;
        }
        if topic.persistent != was_persistent {
            self.persistent_changed = true;
        }
        self.properties_changed(clients, client, id, update);
    }

    pub fn set_flags(
        &mut self,
        clients: &mut ClientTable,
        client: Option<ClientId>,
        id: TopicId,
        flags: u32,
    ) {
        let Some(topic) = self.get_topic_mut(id) else {
            return;
        };
        let was_persistent = topic.persistent;
        let Some(update) = topic.set_flags(flags) else {
            return;
        };
        if topic.persistent != was_persistent {
            self.persistent_changed = true;
        }
        self.properties_changed(clients, client, id, &update);
    }

    /// After a properties change a topic that is no longer published goes
    /// away; otherwise every attached client hears about the change, with
    /// `ack` set for the client that asked for it.
    fn properties_changed(
        &mut self,
        clients: &mut ClientTable,
        client: Option<ClientId>,
        id: TopicId,
        update: &JsonValue,
    ) {
        let Some(topic) = self.get_topic(id) else {
            return;
        };
        if !topic.is_published() {
            self.delete_topic(clients, id);
            return;
        }
        for client_id in topic.clients.keys() {
            if let Some(c) = clients.get_mut(*client_id) {
                c.send_properties_update(topic, update, client == Some(*client_id));
            }
        }
    }

    /// Store and fan out a value. Values older than the stored one are
    /// dropped, except from the client that wrote the stored one or when
    /// either timestamp is unset.
    pub fn set_value(
        &mut self,
        clients: &mut ClientTable,
        client: Option<ClientId>,
        id: TopicId,
        value: &Value,
    ) {
        let Some(topic) = self.topics.get_mut(id as usize).and_then(Option::as_mut) else {
            return;
        };
        if topic.cached {
            let accept = match &topic.last_value {
                None => true,
                Some(last) => {
                    topic.last_value_client == client
                        || last.time() == 0
                        || value.time() >= last.time()
                }
            };
            if accept {
                topic.last_value = Some(value.clone());
                topic.last_value_client = client;
                if topic.persistent {
                    self.persistent_changed = true;
                }
            }
        }

        let topic: &ServerTopic = topic;
        for (client_id, tcd) in &topic.clients {
            if Some(*client_id) == client || tcd.send_mode == ValueSendMode::Disabled {
                continue;
            }
            if let Some(c) = clients.get_mut(*client_id) {
                c.send_value(topic, value, tcd.send_mode);
            }
        }
    }

    /// Drop every trace of a client: its publishers and subscribers on all
    /// topics, topics left unpublished, and its own meta topics.
    pub fn remove_client(&mut self, clients: &mut ClientTable, client: ClientId) {
        let mut pub_changed = Vec::new();
        let mut sub_changed = Vec::new();
        let mut to_delete = Vec::new();

        for topic in self.topics.iter_mut().flatten() {
            let Some(tcd) = topic.clients.remove(&client) else {
                continue;
            };
            topic.publisher_count -= tcd.publishers.len();
            if !topic.is_published() {
                to_delete.push(topic.id);
                continue;
            }
            if !tcd.publishers.is_empty() {
                pub_changed.push(topic.id);
            }
            if !tcd.subscribers.is_empty() {
                sub_changed.push(topic.id);
            }
        }

        for id in pub_changed {
            self.update_meta_topic_pub(clients, id);
        }
        for id in sub_changed {
            self.update_meta_topic_sub(clients, id);
        }
        for id in to_delete {
            self.delete_topic(clients, id);
        }

        let (meta_pub, meta_sub) = clients
            .get(client)
            .map_or((None, None), |c| (c.meta_pub, c.meta_sub));
        if let Some(id) = meta_pub {
            self.delete_topic(clients, id);
        }
        if let Some(id) = meta_sub {
            self.delete_topic(clients, id);
        }
    }

    pub fn update_meta_topic_pub(&mut self, clients: &mut ClientTable, id: TopicId) {
        let Some(topic) = self.get_topic(id) else {
            return;
        };
        let Some(meta_id) = topic.meta_pub else {
            return;
        };
        let bytes = {
            let records: Vec<TopicPublisher> = topic
                .clients
                .iter()
                .flat_map(|(cid, tcd)| {
                    let client = clients.name(*cid);
                    tcd.publishers
                        .iter()
                        .map(move |&pubuid| TopicPublisher { client, pubuid })
                })
                .collect();
            meta::encode(&records)
        };
        self.set_encoded(clients, meta_id, bytes);
    }

    pub fn update_meta_topic_sub(&mut self, clients: &mut ClientTable, id: TopicId) {
        let Some(topic) = self.get_topic(id) else {
            return;
        };
        let Some(meta_id) = topic.meta_sub else {
            return;
        };
        let bytes = {
            let mut records = Vec::new();
            for (cid, tcd) in &topic.clients {
                let Some(c) = clients.get(*cid) else {
                    continue;
                };
                for subuid in &tcd.subscribers {
                    let options = c
                        .subscribers
                        .get(subuid)
                        .map(|s| MetaOptions::from(&s.options))
                        .unwrap_or_default();
                    records.push(TopicSubscriber {
                        client: c.name(),
                        subuid: *subuid,
                        options,
                    });
                }
            }
            meta::encode(&records)
        };
        self.set_encoded(clients, meta_id, bytes);
    }

    pub fn update_meta_client_pub(&mut self, clients: &mut ClientTable, client: ClientId) {
        let Some(c) = clients.get(client) else {
            return;
        };
        let Some(meta_id) = c.meta_pub else {
            return;
        };
        let bytes = {
            let mut pubs: Vec<_> = c.publishers.values().collect();
            pubs.sort_by_key(|p| p.pubuid);
            let records: Vec<ClientPublisher> = pubs
                .into_iter()
                .map(|p| ClientPublisher {
                    uid: p.pubuid,
                    topic: self.get_topic(p.topic).map_or("", |t| t.name.as_str()),
                })
                .collect();
            meta::encode(&records)
        };
        self.set_encoded(clients, meta_id, bytes);
    }

    pub fn update_meta_client_sub(&mut self, clients: &mut ClientTable, client: ClientId) {
        let Some(c) = clients.get(client) else {
            return;
        };
        let Some(meta_id) = c.meta_sub else {
            return;
        };
        let bytes = {
            let records: Vec<ClientSubscriber> = c
                .subscribers
                .values()
                .map(|s| ClientSubscriber {
                    uid: s.subuid,
                    topics: &s.topic_names,
                    options: MetaOptions::from(&s.options),
                })
                .collect();
            meta::encode(&records)
        };
        self.set_encoded(clients, meta_id, bytes);
    }

    /// Publish the `$clients` list.
    pub fn update_meta_clients(
        &mut self,
        clients: &mut ClientTable,
        meta_id: TopicId,
        conns: &[ClientInfo],
    ) {
        let bytes = meta::encode(conns);
        self.set_encoded(clients, meta_id, bytes);
    }

    fn set_encoded(
        &mut self,
        clients: &mut ClientTable,
        meta_id: TopicId,
        bytes: Result<Vec<u8>, rmp_serde::encode::Error>,
    ) {
        match bytes {
            Ok(bytes) => self.set_value(clients, None, meta_id, &Value::raw(bytes, now_micros())),
            Err(e) => warn!("failed to encode meta topic {meta_id}: {e}"),
        }
    }

    /// Serialize every persistent topic that has a value.
    pub fn dump_persistent(&self) -> String {
        let entries: Vec<PersistentEntry> = self
            .topics()
            .filter(|t| t.persistent)
            .filter_map(|t| {
                let value = t.last_value.as_ref()?;
                Some(PersistentEntry {
                    name: t.name.clone(),
                    type_str: t.type_str.clone(),
                    value: json_store::value_to_json(value),
                    properties: t.properties.clone(),
                })
            })
            .collect();
        json_store::dump(&entries)
    }

    /// Load topics from persistent JSON. Returns accumulated errors, one
    /// `"<index>: <message>"` line per rejected entry; empty on success.
    pub fn load_persistent(&mut self, clients: &mut ClientTable, input: &str) -> String {
        let items = match json_store::parse_array(input) {
            Ok(items) => items,
            Err(e) => return e,
        };

        let mut errors = String::new();
        let time = now_micros();
        let persistent_changed = self.persistent_changed;
        for (i, item) in items.iter().enumerate() {
            match json_store::parse_entry(item, time) {
                Ok(entry) => {
                    let id = self.create_topic(
                        clients,
                        None,
                        &entry.name,
                        &entry.type_str,
                        &entry.properties,
                        false,
                    );
                    self.set_value(clients, None, id, &entry.value);
                }
                Err(e) => errors.push_str(&format!("{i}: {e}\n")),
            }
        }
        // loading is not a change that needs saving
        self.persistent_changed = persistent_changed;
        errors
    }
}
