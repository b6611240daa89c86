//! Meta topic payloads.
//!
//! Meta topics (`$pub$<topic>`, `$sub$<topic>`, `$clientpub$<client>`,
//! `$clientsub$<client>`, `$clients`) mirror server state as msgpack arrays
//! of maps. Subscription options only list fields that differ from the
//! defaults.

use serde::Serialize;

use crate::client::PubSubOptions;

pub const CLIENTS_TOPIC: &str = "$clients";
pub const SERVER_PUB_TOPIC: &str = "$serverpub";
pub const SERVER_SUB_TOPIC: &str = "$serversub";
pub const META_TYPE: &str = "msgpack";

pub fn topic_pub_name(topic: &str) -> String {
    format!("$pub${topic}")
}

pub fn topic_sub_name(topic: &str) -> String {
    format!("$sub${topic}")
}

pub fn client_pub_name(client: &str) -> String {
    format!("$clientpub${client}")
}

pub fn client_sub_name(client: &str) -> String {
    format!("$clientsub${client}")
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Default, Serialize)]
pub struct MetaOptions {
    #[serde(skip_serializing_if = "is_false")]
    pub all: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub topicsonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic: Option<f64>,
    #[serde(skip_serializing_if = "is_false")]
    pub prefix: bool,
}

impl From<&PubSubOptions> for MetaOptions {
    fn from(opts: &PubSubOptions) -> Self {
        let defaults = PubSubOptions::default();
        Self {
            all: opts.send_all,
            topicsonly: opts.topics_only,
            periodic: (opts.periodic != defaults.periodic).then_some(opts.periodic),
            prefix: opts.prefix_match,
        }
    }
}

/// Entry of `$pub$<topic>`.
#[derive(Debug, Serialize)]
pub struct TopicPublisher<'a> {
    pub client: &'a str,
    pub pubuid: i64,
}

/// Entry of `$sub$<topic>`.
#[derive(Debug, Serialize)]
pub struct TopicSubscriber<'a> {
    pub client: &'a str,
    pub subuid: i64,
    pub options: MetaOptions,
}

/// Entry of `$clientpub$<client>`.
#[derive(Debug, Serialize)]
pub struct ClientPublisher<'a> {
    pub uid: i64,
    pub topic: &'a str,
}

/// Entry of `$clientsub$<client>`.
#[derive(Debug, Serialize)]
pub struct ClientSubscriber<'a> {
    pub uid: i64,
    pub topics: &'a [String],
    pub options: MetaOptions,
}

/// Entry of `$clients`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub conn: String,
    pub ver: u16,
}

pub fn encode<T: Serialize>(records: &[T]) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(records)
}
