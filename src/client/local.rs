//! The in-process client.
//!
//! Local publishers and subscribers talk to the server through
//! `ServerImpl::handle_local` and receive updates as `LocalEvent`s on a
//! channel. Nothing here is queued or rate limited.

use std::collections::HashSet;

use serde_json::{Map, Value as JsonValue};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::broker::topic::{ServerTopic, TopicId, ValueSendMode};
use crate::broker::value::Value;
use crate::transport::message::ClientMessage;

/// Something the server tells the local side.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    Announce {
        name: String,
        id: TopicId,
        type_str: String,
        properties: Map<String, JsonValue>,
        pubuid: Option<i64>,
    },
    Unannounce {
        name: String,
        id: TopicId,
    },
    Properties {
        name: String,
        update: JsonValue,
        ack: bool,
    },
    Value {
        id: TopicId,
        name: String,
        value: Value,
    },
}

/// Something the local side asks the server to do.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalRequest {
    Control(ClientMessage),
    SetValue { pubuid: i64, value: Value },
}

#[derive(Debug, Default)]
pub struct LocalSession {
    events: Option<UnboundedSender<LocalEvent>>,
    announced: HashSet<TopicId>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_events(&mut self, events: UnboundedSender<LocalEvent>) {
        self.events = Some(events);
    }

    fn emit(&self, event: LocalEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("local event receiver dropped");
            }
        }
    }

    pub fn send_announce(&mut self, topic: &ServerTopic, pubuid: Option<i64>) {
        if !self.announced.insert(topic.id) && pubuid.is_none() {
            return;
        }
        self.emit(LocalEvent::Announce {
            name: topic.name.clone(),
            id: topic.id,
            type_str: topic.type_str.clone(),
            properties: topic.properties.clone(),
            pubuid,
        });
    }

    pub fn send_unannounce(&mut self, topic: &ServerTopic) {
        if !self.announced.remove(&topic.id) {
            return;
        }
        self.emit(LocalEvent::Unannounce {
            name: topic.name.clone(),
            id: topic.id,
        });
    }

    pub fn send_properties_update(&mut self, topic: &ServerTopic, update: &JsonValue, ack: bool) {
        if !self.announced.contains(&topic.id) {
            return;
        }
        self.emit(LocalEvent::Properties {
            name: topic.name.clone(),
            update: update.clone(),
            ack,
        });
    }

    pub fn send_value(&mut self, topic: &ServerTopic, value: &Value, mode: ValueSendMode) {
        if mode == ValueSendMode::Disabled {
            return;
        }
        self.emit(LocalEvent::Value {
            id: topic.id,
            name: topic.name.clone(),
            value: value.clone(),
        });
    }
}
