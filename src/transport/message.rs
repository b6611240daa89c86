//! NT4 text (JSON) control messages.
//!
//! Every text frame is a JSON array of `{"method": ..., "params": {...}}`
//! objects. A frame that is not an array is a protocol error; a single
//! malformed element is logged and skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::client::PubSubOptions;
use crate::utils::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum ClientMessage {
    #[serde(rename = "publish")]
    Publish {
        name: String,
        pubuid: i64,
        #[serde(rename = "type")]
        type_str: String,
        #[serde(default)]
        properties: Map<String, JsonValue>,
    },
    #[serde(rename = "unpublish")]
    Unpublish { pubuid: i64 },
    #[serde(rename = "setproperties")]
    SetProperties { name: String, update: JsonValue },
    #[serde(rename = "subscribe")]
    Subscribe {
        topics: Vec<String>,
        subuid: i64,
        #[serde(default)]
        options: SubscribeOptions,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { subuid: i64 },
}

/// Subscription options as they appear on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SubscribeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topicsonly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<bool>,
}

impl From<&SubscribeOptions> for PubSubOptions {
    fn from(opts: &SubscribeOptions) -> Self {
        let defaults = PubSubOptions::default();
        PubSubOptions {
            periodic: opts.periodic.unwrap_or(defaults.periodic),
            send_all: opts.all.unwrap_or(defaults.send_all),
            topics_only: opts.topicsonly.unwrap_or(defaults.topics_only),
            prefix_match: opts.prefix.unwrap_or(defaults.prefix_match),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum ServerMessage {
    #[serde(rename = "announce")]
    Announce {
        name: String,
        id: i64,
        #[serde(rename = "type")]
        type_str: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pubuid: Option<i64>,
        properties: Map<String, JsonValue>,
    },
    #[serde(rename = "unannounce")]
    Unannounce { name: String, id: i64 },
    #[serde(rename = "properties")]
    Properties {
        name: String,
        update: JsonValue,
        ack: bool,
    },
}

impl ServerMessage {
    pub fn approx_size(&self) -> usize {
        match self {
            ServerMessage::Announce {
                name,
                type_str,
                properties,
                ..
            } => name.len() + type_str.len() + properties.len() * 16 + 64,
            ServerMessage::Unannounce { name, .. } => name.len() + 48,
            ServerMessage::Properties { name, update, .. } => {
                name.len() + update.as_object().map_or(0, |u| u.len() * 16) + 48
            }
        }
    }
}

/// Parse one NT4 text frame.
pub fn decode_client_messages(text: &str) -> Result<Vec<ClientMessage>, DecodeError> {
    let frame: JsonValue =
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    let JsonValue::Array(items) = frame else {
        return Err(DecodeError::Json("expected JSON array at top level".into()));
    };

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<ClientMessage>(item) {
            Ok(msg) => out.push(msg),
            Err(e) => warn!("{i}: {e}"),
        }
    }
    Ok(out)
}
