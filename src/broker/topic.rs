//! Topic management
//!
//! A `ServerTopic` is one named, typed slot of the shared table. Besides its
//! properties and last value it keeps, per connected client, which of that
//! client's publishers and subscribers are attached to it (`TopicClientData`).
//! Clients are referenced by slot id only; the client table owns them.
//!
//! Concurrency note: topics are only ever mutated through `ServerStorage`,
//! which callers must serialize (for example behind the server lock).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value as JsonValue, json};

use crate::broker::value::Value;
use crate::client::{ClientId, PubSubOptions, SubscriberData};

pub type TopicId = u32;

/// Legacy (NT3) flag bits accepted by `ServerStorage::set_flags`.
pub const NT_PERSISTENT: u32 = 0x01;
pub const NT_RETAINED: u32 = 0x02;
pub const NT_UNCACHED: u32 = 0x04;

/// How value updates for a topic are delivered to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueSendMode {
    /// No value-carrying subscriber (topics-only, or none at all).
    #[default]
    Disabled,
    /// Queue every update.
    All,
    /// Coalesce updates; the newest pending value wins.
    Normal,
    /// Bypass the queue and write straight to the wire.
    Imm,
}

/// The relationship between one topic and one client.
#[derive(Debug, Default, Clone)]
pub struct TopicClientData {
    pub publishers: BTreeSet<i64>,
    pub subscribers: BTreeSet<i64>,
    pub send_mode: ValueSendMode,
}

impl TopicClientData {
    /// Attach a subscriber. Returns true if it was not attached before.
    pub fn add_subscriber(&mut self, subuid: i64, options: &PubSubOptions) -> bool {
        let added = self.subscribers.insert(subuid);
        if !options.topics_only {
            if options.send_all {
                self.send_mode = ValueSendMode::All;
            } else if self.send_mode == ValueSendMode::Disabled {
                self.send_mode = ValueSendMode::Normal;
            }
        }
        added
    }

    /// Recompute the send mode from the subscribers still attached.
    pub fn refresh_send_mode(&mut self, subscribers: &BTreeMap<i64, SubscriberData>) {
        self.send_mode = ValueSendMode::Disabled;
        for sub in self.subscribers.iter().filter_map(|uid| subscribers.get(uid)) {
            if sub.options.topics_only {
                continue;
            }
            if sub.options.send_all {
                self.send_mode = ValueSendMode::All;
            } else if self.send_mode == ValueSendMode::Disabled {
                self.send_mode = ValueSendMode::Normal;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ServerTopic {
    pub id: TopicId,
    pub name: String,
    pub type_str: String,
    pub properties: Map<String, JsonValue>,
    pub last_value: Option<Value>,
    /// Client that wrote `last_value`; `None` is the server itself.
    pub last_value_client: Option<ClientId>,
    pub publisher_count: usize,
    pub persistent: bool,
    pub retained: bool,
    pub cached: bool,
    /// Meta topics are special: they never get meta topics of their own.
    pub special: bool,
    pub clients: BTreeMap<ClientId, TopicClientData>,
    pub meta_pub: Option<TopicId>,
    pub meta_sub: Option<TopicId>,
}

impl ServerTopic {
    pub fn new(
        id: TopicId,
        name: &str,
        type_str: &str,
        properties: Map<String, JsonValue>,
        special: bool,
    ) -> Self {
        let mut topic = Self {
            id,
            name: name.to_string(),
            type_str: type_str.to_string(),
            properties,
            last_value: None,
            last_value_client: None,
            publisher_count: 0,
            persistent: false,
            retained: false,
            cached: true,
            special,
            clients: BTreeMap::new(),
            meta_pub: None,
            meta_sub: None,
        };
        topic.refresh_properties();
        topic
    }

    /// A topic stays alive while this holds.
    pub fn is_published(&self) -> bool {
        self.persistent || self.retained || self.publisher_count != 0
    }

    pub fn add_publisher(&mut self, client: ClientId, pubuid: i64) {
        if self.clients.entry(client).or_default().publishers.insert(pubuid) {
            self.publisher_count += 1;
        }
    }

    pub fn remove_publisher(&mut self, client: ClientId, pubuid: i64) {
        let Some(tcd) = self.clients.get_mut(&client) else {
            return;
        };
        if tcd.publishers.remove(&pubuid) {
            self.publisher_count -= 1;
        }
        if tcd.is_empty() {
            self.clients.remove(&client);
        }
    }

    /// Merge a properties patch. Null values remove keys.
    ///
    /// Returns true if anything was applied.
    pub fn set_properties(&mut self, update: &JsonValue) -> bool {
        let Some(update) = update.as_object() else {
            return false;
        };
        if update.is_empty() {
            return false;
        }
        for (key, value) in update {
            if value.is_null() {
                self.properties.remove(key);
            } else {
                self.properties.insert(key.clone(), value.clone());
            }
        }
        self.refresh_properties();
        true
    }

    pub fn refresh_properties(&mut self) {
        self.persistent = self
            .properties
            .get("persistent")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        self.retained = self
            .properties
            .get("retained")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        self.cached = self
            .properties
            .get("cached")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true);
        if !self.cached {
            self.last_value = None;
            self.last_value_client = None;
        }
    }

    /// Apply a legacy flags bitmask.
    ///
    /// Returns the properties patch describing what changed, or `None` when
    /// nothing did.
    pub fn set_flags(&mut self, flags: u32) -> Option<JsonValue> {
        let mut update = Map::new();

        let persistent = flags & NT_PERSISTENT != 0;
        if persistent != self.persistent {
            update.insert(
                "persistent".into(),
                if persistent { json!(true) } else { JsonValue::Null },
            );
        }
        let retained = flags & NT_RETAINED != 0;
        if retained != self.retained {
            update.insert(
                "retained".into(),
                if retained { json!(true) } else { JsonValue::Null },
            );
        }
        let cached = flags & NT_UNCACHED == 0;
        if cached != self.cached {
            update.insert(
                "cached".into(),
                if cached { JsonValue::Null } else { json!(false) },
            );
        }

        if update.is_empty() {
            return None;
        }
        let update = JsonValue::Object(update);
        self.set_properties(&update);
        Some(update)
    }

    /// Current flags in legacy bitmask form.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.persistent {
            flags |= NT_PERSISTENT;
        }
        if self.retained {
            flags |= NT_RETAINED;
        }
        if !self.cached {
            flags |= NT_UNCACHED;
        }
        flags
    }
}
