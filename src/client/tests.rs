use std::sync::{Arc, Mutex};

use serde_json::{Map, json};

use super::nt3::{STALL_TIMEOUT_US, State3};
use super::outgoing::{DEFAULT_PERIOD_MS, NetworkOutgoingQueue, OUTGOING_LIMIT, gcd};
use super::{ClientId, PubSubOptions, Session3, SessionKind, SubscriberData};
use crate::broker::ServerImpl;
use crate::broker::topic::{ServerTopic, ValueSendMode};
use crate::broker::value::{Value, ValueData};
use crate::transport::codec::{PING_ID, encode_frame};
use crate::transport::message::ServerMessage;
use crate::transport::wire::testing::RecordingWire;
use crate::transport::wire3::{FLAG_PERSISTENT, Message3, PROTO_REV, UNASSIGNED_ID, encode_all};
use crate::utils::time::{now_micros, now_millis};

fn announce(name: &str, id: i64) -> ServerMessage {
    ServerMessage::Announce {
        name: name.to_string(),
        id,
        type_str: "double".into(),
        pubuid: None,
        properties: Default::default(),
    }
}

// ---- outgoing queue ----

#[test]
fn test_normal_values_coalesce() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(false);

    queue.send_value(&mut wire, 1, &Value::double(1.0, 10), ValueSendMode::Normal);
    queue.send_value(&mut wire, 1, &Value::double(2.0, 30), ValueSendMode::Normal);
    // older than what is pending: dropped
    queue.send_value(&mut wire, 1, &Value::double(3.0, 20), ValueSendMode::Normal);

    assert_eq!(queue.pending_values(1), vec![&Value::double(2.0, 30)]);
    assert_eq!(queue.total_size(), Value::double(2.0, 30).approx_size());
    assert!(wire.frames().is_empty());
}

#[test]
fn test_all_values_queue_every_update() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(false);
    for t in 1..=3 {
        queue.send_value(&mut wire, 4, &Value::integer(t, t), ValueSendMode::All);
    }
    assert_eq!(queue.pending_values(4).len(), 3);
}

#[test]
fn test_all_degrades_to_normal_over_limit() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(false);
    queue.send_value(&mut wire, 1, &Value::raw(vec![0; OUTGOING_LIMIT], 1), ValueSendMode::All);
    assert!(queue.total_size() >= OUTGOING_LIMIT);

    queue.send_value(&mut wire, 2, &Value::double(1.0, 1), ValueSendMode::All);
    queue.send_value(&mut wire, 2, &Value::double(2.0, 2), ValueSendMode::All);
    assert_eq!(queue.pending_values(2), vec![&Value::double(2.0, 2)]);
}

#[test]
fn test_local_queue_writes_immediately() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(true);
    queue.send_value(&mut wire, 9, &Value::boolean(true, 5), ValueSendMode::Normal);
    assert_eq!(queue.pending(), 0);
    let frames = wire.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 9);
    assert_eq!(frames[0].value, Value::boolean(true, 5));
}

#[test]
fn test_set_period_moves_pending_messages() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(false);
    queue.send_message(1, announce("/a", 1));
    queue.send_value(&mut wire, 1, &Value::double(1.0, 1), ValueSendMode::Normal);
    queue.send_value(&mut wire, 2, &Value::double(5.0, 1), ValueSendMode::Normal);

    queue.set_period(1, 20);
    assert_eq!(queue.period_of(1), 20);
    assert_eq!(queue.period_of(2), DEFAULT_PERIOD_MS);
    assert_eq!(queue.pending(), 3);

    // coalescing still finds the moved value, and the one left behind
    queue.send_value(&mut wire, 1, &Value::double(1.5, 2), ValueSendMode::Normal);
    queue.send_value(&mut wire, 2, &Value::double(5.5, 2), ValueSendMode::Normal);
    assert_eq!(queue.pending(), 3);
    assert_eq!(queue.pending_values(1), vec![&Value::double(1.5, 2)]);
    assert_eq!(queue.pending_values(2), vec![&Value::double(5.5, 2)]);

    // periods are floored
    queue.set_period(2, 1);
    assert_eq!(queue.period_of(2), 5);

    queue.send_outgoing(&mut wire, 1_000, false);
    assert_eq!(queue.pending(), 0);
    assert_eq!(queue.total_size(), 0);
    assert_eq!(wire.server_messages(), vec![announce("/a", 1)]);
    assert_eq!(wire.frames().len(), 2);
}

#[test]
fn test_send_outgoing_gates() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(false);

    queue.send_value(&mut wire, 1, &Value::double(1.0, 1), ValueSendMode::Normal);
    wire.set_ready(false);
    queue.send_outgoing(&mut wire, 1_000, false);
    assert_eq!(queue.pending(), 1);

    wire.set_ready(true);
    queue.send_outgoing(&mut wire, 1_000, false);
    assert_eq!(queue.pending(), 0);

    // too soon after the last send
    queue.send_value(&mut wire, 1, &Value::double(2.0, 2), ValueSendMode::Normal);
    queue.send_outgoing(&mut wire, 1_003, true);
    assert_eq!(queue.pending(), 1);

    // the bucket is not due until its period has passed
    queue.send_outgoing(&mut wire, 1_010, false);
    assert_eq!(queue.pending(), 1);
    queue.send_outgoing(&mut wire, 1_010 + u64::from(DEFAULT_PERIOD_MS), false);
    assert_eq!(queue.pending(), 0);
    assert_eq!(wire.frames().len(), 2);
}

#[test]
fn test_partial_send_keeps_unsent_tail() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(false);
    for id in 1..=3 {
        queue.send_value(&mut wire, id, &Value::integer(i64::from(id), 1), ValueSendMode::Normal);
    }
    {
        let mut log = wire.log.lock().unwrap();
        log.accept_before_unsent = 2;
        log.unsent_next = 1;
    }
    queue.send_outgoing(&mut wire, 1_000, false);
    assert_eq!(wire.frames().len(), 2);
    assert_eq!(queue.pending(), 1);

    // the remaining value is still the coalescing target for its topic
    queue.send_value(&mut wire, 3, &Value::integer(30, 2), ValueSendMode::Normal);
    assert_eq!(queue.pending_values(3), vec![&Value::integer(30, 2)]);
    // sent topics start fresh
    queue.send_value(&mut wire, 1, &Value::integer(10, 2), ValueSendMode::Normal);
    assert_eq!(queue.pending(), 2);

    queue.send_outgoing(&mut wire, 1_010, true);
    assert_eq!(queue.pending(), 0);
    let values: Vec<ValueData> = wire.frames().into_iter().map(|f| f.value.data).collect();
    assert_eq!(
        values,
        vec![
            ValueData::Integer(1),
            ValueData::Integer(2),
            ValueData::Integer(30),
            ValueData::Integer(10),
        ]
    );
}

#[test]
fn test_unannounce_stops_coalescing() {
    let mut wire = RecordingWire::new();
    let mut queue = NetworkOutgoingQueue::new(false);
    queue.send_value(&mut wire, 1, &Value::double(1.0, 1), ValueSendMode::Normal);
    queue.forget_value(1);
    queue.send_value(&mut wire, 1, &Value::double(2.0, 2), ValueSendMode::Normal);
    assert_eq!(queue.pending_values(1).len(), 2);
}

// ---- options and periods ----

#[test]
fn test_subscriber_period() {
    let opts = |periodic| PubSubOptions {
        periodic,
        ..PubSubOptions::default()
    };
    assert_eq!(PubSubOptions::default().period_ms(), 100);
    assert_eq!(opts(0.05).period_ms(), 50);
    assert_eq!(opts(0.016).period_ms(), 20);
    assert_eq!(opts(0.001).period_ms(), 5);
    assert_eq!(opts(-1.0).period_ms(), 5);
    assert_eq!(gcd(100, 30), 10);
    assert_eq!(gcd(20, 0), 20);
}

#[test]
fn test_subscriber_matching() {
    let exact = SubscriberData::new(1, vec!["/a".into()], PubSubOptions::default());
    assert!(exact.matches("/a", false));
    assert!(!exact.matches("/ab", false));

    let prefix = SubscriberData::new(
        2,
        vec!["".into(), "$pub$".into()],
        PubSubOptions {
            prefix_match: true,
            ..PubSubOptions::default()
        },
    );
    assert!(prefix.matches("/anything", false));
    assert!(prefix.matches("$pub$/x", true));
    assert!(!prefix.matches("$clients", true));
}

fn nt4_client(server: &mut ServerImpl, name: &str) -> (RecordingWire, ClientId) {
    let wire = RecordingWire::new();
    let (_, id) = server.add_client(name, "127.0.0.1:5000", false, wire.boxed());
    (wire, id)
}

fn send_text(server: &mut ServerImpl, id: ClientId, msgs: serde_json::Value) {
    server.process_incoming_text(id, &msgs.to_string());
}

fn publish(server: &mut ServerImpl, id: ClientId, name: &str, pubuid: i64) {
    send_text(
        server,
        id,
        json!([{"method": "publish", "params": {"name": name, "pubuid": pubuid, "type": "double"}}]),
    );
}

fn set_value(server: &mut ServerImpl, id: ClientId, pubuid: i64, value: &Value) {
    server.process_incoming_binary(id, &encode_frame(pubuid, value).unwrap());
}

fn last_value(server: &ServerImpl, name: &str) -> Option<ValueData> {
    let topic = server.storage().get_topic_by_name(name)?;
    topic.last_value.as_ref().map(|v| v.data.clone())
}

#[test]
fn test_client_period_is_gcd_of_subscribers() {
    let mut server = ServerImpl::new();
    let (_wire, a) = nt4_client(&mut server, "a");
    publish(&mut server, a, "/x", 1);
    assert_eq!(server.client(a).unwrap().period_ms(), None);

    send_text(
        &mut server,
        a,
        json!([
            {"method": "subscribe", "params": {"topics": ["/x"], "subuid": 1}},
            {"method": "subscribe", "params": {"topics": ["/x"], "subuid": 2, "options": {"periodic": 0.03}}}
        ]),
    );
    assert_eq!(server.client(a).unwrap().period_ms(), Some(10));
    let topic = server.storage().find_topic("/x").unwrap();
    match &server.client(a).unwrap().kind {
        SessionKind::V4(session) => assert_eq!(session.outgoing().period_of(topic), 10),
        _ => panic!("not an NT4 session"),
    }

    send_text(
        &mut server,
        a,
        json!([{"method": "unsubscribe", "params": {"subuid": 2}}]),
    );
    assert_eq!(server.client(a).unwrap().period_ms(), Some(100));
    match &server.client(a).unwrap().kind {
        SessionKind::V4(session) => assert_eq!(session.outgoing().period_of(topic), 100),
        _ => panic!("not an NT4 session"),
    }
}

#[test]
fn test_periodic_sends_follow_client_period() {
    let mut server = ServerImpl::new();
    let (_wire, a) = nt4_client(&mut server, "a");
    let client = server.client_mut(a).unwrap();
    // no subscribers yet: always due
    assert!(client.periodic_due(1_000));
    assert!(client.periodic_due(1_001));

    send_text(
        &mut server,
        a,
        json!([{"method": "subscribe", "params": {"topics": ["/x"], "subuid": 1, "options": {"periodic": 0.05}}}]),
    );
    let client = server.client_mut(a).unwrap();
    assert!(client.periodic_due(2_000));
    assert!(!client.periodic_due(2_030));
    assert!(client.periodic_due(2_050));
    assert!(!client.periodic_due(2_099));
}

#[test]
fn test_resubscribe_replaces_filter() {
    let mut server = ServerImpl::new();
    let (_pub_wire, p) = nt4_client(&mut server, "p");
    publish(&mut server, p, "/a", 1);
    publish(&mut server, p, "/b", 2);

    let (wire, s) = nt4_client(&mut server, "s");
    send_text(
        &mut server,
        s,
        json!([{"method": "subscribe", "params": {"topics": ["/a"], "subuid": 1}}]),
    );
    send_text(
        &mut server,
        s,
        json!([{"method": "subscribe", "params": {"topics": ["/b"], "subuid": 1}}]),
    );

    let a = server.storage().get_topic_by_name("/a").unwrap();
    assert!(!a.clients.contains_key(&s));
    let b = server.storage().get_topic_by_name("/b").unwrap();
    assert!(b.clients[&s].subscribers.contains(&1));

    server.send_all_outgoing(now_millis(), true);
    let names: Vec<String> = wire
        .server_messages()
        .into_iter()
        .filter_map(|m| match m {
            ServerMessage::Announce { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["/a".to_string(), "/b".to_string()]);
}

// ---- NT4 sessions ----

#[test]
fn test_ping_gets_server_time() {
    let mut server = ServerImpl::new();
    let (wire, a) = nt4_client(&mut server, "a");
    let before = now_micros();
    set_value(&mut server, a, PING_ID, &Value::integer(1234, 0));

    let frames = wire.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, PING_ID);
    assert_eq!(frames[0].value.data, ValueData::Integer(1234));
    assert!(frames[0].value.time >= before);
}

#[test]
fn test_large_binary_frame_spills_to_backlog() {
    let mut server = ServerImpl::new();
    let (wire, a) = nt4_client(&mut server, "a");
    publish(&mut server, a, "/x", 1);

    let mut buf = Vec::new();
    for i in 0..15 {
        buf.extend(encode_frame(1, &Value::double(f64::from(i), i64::from(i) + 1)).unwrap());
    }
    assert!(server.process_incoming_binary(a, &buf));
    assert!(!wire.is_reading());
    assert_eq!(last_value(&server, "/x"), Some(ValueData::Double(9.0)));

    assert!(server.process_incoming_messages(2));
    assert_eq!(last_value(&server, "/x"), Some(ValueData::Double(11.0)));
    assert!(!wire.is_reading());

    assert!(!server.process_incoming_messages(ServerImpl::MAX_BACKLOG_BATCH));
    assert_eq!(last_value(&server, "/x"), Some(ValueData::Double(14.0)));
    assert!(wire.is_reading());
}

#[test]
fn test_bad_text_disconnects() {
    let mut server = ServerImpl::new();
    let (wire, a) = nt4_client(&mut server, "a");

    // a bad element is skipped, the rest still applies
    send_text(
        &mut server,
        a,
        json!([{"method": "bogus"}, {"method": "publish", "params": {"name": "/ok", "pubuid": 1, "type": "int"}}]),
    );
    assert!(wire.disconnect_reason().is_none());
    assert!(server.storage().get_topic_by_name("/ok").is_some());

    server.process_incoming_text(a, "{\"method\": \"publish\"}");
    assert!(wire.disconnect_reason().is_some());
}

#[test]
fn test_bad_binary_disconnects() {
    let mut server = ServerImpl::new();
    let (wire, a) = nt4_client(&mut server, "a");
    server.process_incoming_binary(a, &[0xc1, 0x00]);
    assert!(wire.disconnect_reason().is_some());
}

#[test]
fn test_unknown_ids_are_ignored() {
    let mut server = ServerImpl::new();
    let (wire, a) = nt4_client(&mut server, "a");
    let topics = server.storage().topic_count();

    set_value(&mut server, a, 77, &Value::double(1.0, 1));
    send_text(
        &mut server,
        a,
        json!([
            {"method": "unpublish", "params": {"pubuid": 77}},
            {"method": "unsubscribe", "params": {"subuid": 77}},
            {"method": "setproperties", "params": {"name": "/nope", "update": {"retained": true}}}
        ]),
    );
    assert_eq!(server.storage().topic_count(), topics);
    assert!(wire.disconnect_reason().is_none());
}

#[test]
fn test_duplicate_publish_is_ignored() {
    let mut server = ServerImpl::new();
    let (_wire, a) = nt4_client(&mut server, "a");
    publish(&mut server, a, "/x", 1);
    publish(&mut server, a, "/y", 1);
    assert!(server.storage().get_topic_by_name("/y").is_none());
    assert_eq!(server.client(a).unwrap().publishers.len(), 1);
}

#[test]
fn test_setproperties_on_meta_topic_is_ignored() {
    let mut server = ServerImpl::new();
    let (_wire, a) = nt4_client(&mut server, "a");
    publish(&mut server, a, "/x", 1);
    let meta = server.storage().find_topic("$pub$/x").unwrap();

    send_text(
        &mut server,
        a,
        json!([{"method": "setproperties", "params": {"name": "$pub$/x", "update": {"retained": null}}}]),
    );
    let topic = server.storage().get_topic(meta).unwrap();
    assert_eq!(topic.name, "$pub$/x");
    assert!(topic.retained);
    let x = server.storage().get_topic_by_name("/x").unwrap();
    assert_eq!(x.meta_pub, Some(meta));

    // another client's meta topics survive /x going away
    let (_b_wire, b) = nt4_client(&mut server, "b");
    publish(&mut server, b, "/y", 1);
    send_text(
        &mut server,
        a,
        json!([{"method": "unpublish", "params": {"pubuid": 1}}]),
    );
    assert!(server.storage().get_topic_by_name("/x").is_none());
    assert!(server.storage().get_topic_by_name("$pub$/x").is_none());
    assert!(server.storage().get_topic_by_name("$clientpub$b").is_some());
    assert!(server.storage().get_topic_by_name("$pub$/y").is_some());
}

// ---- NT3 sessions ----

type Connected = Arc<Mutex<Vec<(ClientId, String, u16)>>>;

fn nt3_client(server: &mut ServerImpl) -> (RecordingWire, ClientId, Connected) {
    let wire = RecordingWire::new();
    let connected: Connected = Arc::default();
    let seen = connected.clone();
    let id = server.add_client3(
        "127.0.0.1:1735",
        false,
        wire.boxed(),
        Some(Box::new(move |id: ClientId, name: &str, rev: u16| {
            seen.lock().unwrap().push((id, name.to_string(), rev));
        })),
    );
    (wire, id, connected)
}

fn send3(server: &mut ServerImpl, id: ClientId, msgs: &[Message3]) {
    server.process_incoming_binary(id, &encode_all(msgs));
}

fn hello(self_id: &str) -> Message3 {
    Message3::ClientHello {
        proto_rev: PROTO_REV,
        self_id: self_id.to_string(),
    }
}

fn state3(server: &ServerImpl, id: ClientId) -> State3 {
    match &server.client(id).unwrap().kind {
        SessionKind::V3(session) => session.state(),
        _ => panic!("not an NT3 session"),
    }
}

fn decoder_error(server: &ServerImpl, id: ClientId) -> Option<String> {
    match &server.client(id).unwrap().kind {
        SessionKind::V3(session) => session.decoder().error().map(ToString::to_string),
        _ => panic!("not an NT3 session"),
    }
}

/// NT4 publisher with `/x` = 1.5 already set.
fn server_with_x() -> (ServerImpl, ClientId, u16) {
    let mut server = ServerImpl::new();
    let (_wire, a) = nt4_client(&mut server, "a");
    publish(&mut server, a, "/x", 1);
    set_value(&mut server, a, 1, &Value::double(1.5, 10));
    let id = server.storage().find_topic("/x").unwrap() as u16;
    (server, a, id)
}

#[test]
fn test_nt3_handshake() {
    let (mut server, _a, x_id) = server_with_x();
    let (wire, c, connected) = nt3_client(&mut server);
    assert_eq!(state3(&server, c), State3::Initial);

    send3(&mut server, c, &[hello("bot")]);
    assert_eq!(state3(&server, c), State3::ServerHelloComplete);
    assert_eq!(server.client(c).unwrap().name(), "bot-NT3@127.0.0.1:1735");
    assert_eq!(
        *connected.lock().unwrap(),
        vec![(c, "bot-NT3@127.0.0.1:1735".to_string(), PROTO_REV)]
    );

    let msgs = wire.messages3();
    assert_eq!(msgs.len(), 3);
    assert_eq!(
        msgs[0],
        Message3::ServerHello {
            flags: 0,
            self_id: "server".into()
        }
    );
    match &msgs[1] {
        Message3::EntryAssign {
            name,
            id,
            seq_num,
            flags,
            value,
        } => {
            assert_eq!(name, "/x");
            assert_eq!(*id, x_id);
            assert_eq!(*seq_num, 0);
            assert_eq!(*flags, 0);
            assert_eq!(value.data, ValueData::Double(1.5));
        }
        other => panic!("expected entry assign, got {other:?}"),
    }
    assert_eq!(msgs[2], Message3::ServerHelloDone);

    send3(&mut server, c, &[Message3::ClientHelloDone]);
    assert_eq!(state3(&server, c), State3::Running);
    assert!(decoder_error(&server, c).is_none());
    assert!(
        server
            .storage()
            .get_topic_by_name("$clientsub$bot-NT3@127.0.0.1:1735")
            .is_some()
    );
}

#[test]
fn test_nt3_update_before_hello_done_is_rejected() {
    let (mut server, _a, x_id) = server_with_x();
    let (wire, c, _) = nt3_client(&mut server);

    send3(
        &mut server,
        c,
        &[
            hello(""),
            Message3::EntryUpdate {
                id: x_id,
                seq_num: 1,
                value: Value::double(9.0, 0),
            },
        ],
    );

    let error = decoder_error(&server, c).unwrap();
    assert!(error.contains("EntryUpdate before ClientHelloDone"), "{error}");
    assert_eq!(wire.disconnect_reason(), Some(error));
    assert_eq!(last_value(&server, "/x"), Some(ValueData::Double(1.5)));
    assert_eq!(server.client(c).unwrap().name(), "NT3@127.0.0.1:1735");
}

#[test]
fn test_nt3_unsupported_protocol() {
    let mut server = ServerImpl::new();
    let (wire, c, connected) = nt3_client(&mut server);
    send3(
        &mut server,
        c,
        &[Message3::ClientHello {
            proto_rev: 0x0200,
            self_id: String::new(),
        }],
    );
    assert_eq!(
        wire.messages3(),
        vec![Message3::ProtoUnsup {
            proto_rev: PROTO_REV
        }]
    );
    assert_eq!(
        wire.disconnect_reason().as_deref(),
        Some("unsupported protocol version")
    );
    assert!(connected.lock().unwrap().is_empty());
}

#[test]
fn test_nt3_keep_alive_requires_running() {
    let mut server = ServerImpl::new();
    let (wire, c, _) = nt3_client(&mut server);
    send3(&mut server, c, &[Message3::KeepAlive]);
    let error = decoder_error(&server, c).unwrap();
    assert!(error.contains("KeepAlive"), "{error}");
    assert_eq!(wire.disconnect_reason(), Some(error));

    let (wire, d) = running_nt3(&mut server);
    send3(&mut server, d, &[Message3::KeepAlive]);
    assert!(decoder_error(&server, d).is_none());
    assert!(wire.disconnect_reason().is_none());
}

fn running_nt3(server: &mut ServerImpl) -> (RecordingWire, ClientId) {
    let (wire, c, _) = nt3_client(server);
    send3(server, c, &[hello("bot"), Message3::ClientHelloDone]);
    assert_eq!(state3(server, c), State3::Running);
    wire.clear();
    (wire, c)
}

#[test]
fn test_nt3_entry_assign_creates_topic() {
    let mut server = ServerImpl::new();
    let (sub_wire, s) = nt4_client(&mut server, "s");
    send_text(
        &mut server,
        s,
        json!([{"method": "subscribe", "params": {"topics": ["/nt3"], "subuid": 1, "options": {"prefix": true}}}]),
    );
    let (wire, c) = running_nt3(&mut server);

    send3(
        &mut server,
        c,
        &[Message3::EntryAssign {
            name: "/nt3/speed".into(),
            id: UNASSIGNED_ID,
            seq_num: 0,
            flags: FLAG_PERSISTENT,
            value: Value::double(2.0, 0),
        }],
    );

    let topic = server.storage().get_topic_by_name("/nt3/speed").unwrap();
    let topic_id = topic.id;
    assert_eq!(topic.type_str, "double");
    assert!(topic.persistent);
    assert!(topic.retained);
    assert_eq!(topic.publisher_count, 1);
    assert_eq!(last_value(&server, "/nt3/speed"), Some(ValueData::Double(2.0)));

    server.send_all_outgoing(now_millis(), true);
    // the client learns its entry id
    match wire.messages3().as_slice() {
        [Message3::EntryAssign { name, id, flags, .. }] => {
            assert_eq!(name, "/nt3/speed");
            assert_eq!(u32::from(*id), topic_id);
            assert_eq!(*flags, FLAG_PERSISTENT);
        }
        other => panic!("expected one entry assign, got {other:?}"),
    }
    // and NT4 subscribers see it like any other topic
    assert_eq!(sub_wire.server_messages().len(), 1);
    assert_eq!(sub_wire.frames()[0].value.data, ValueData::Double(2.0));
}

#[test]
fn test_nt3_entry_update_publishes_and_fans_out() {
    let (mut server, _a, x_id) = server_with_x();
    let (wire, c) = running_nt3(&mut server);
    let (other_wire, d) = running_nt3(&mut server);

    send3(
        &mut server,
        c,
        &[Message3::EntryUpdate {
            id: x_id,
            seq_num: 4,
            value: Value::double(4.0, 0),
        }],
    );
    assert_eq!(last_value(&server, "/x"), Some(ValueData::Double(4.0)));
    assert_eq!(server.client(c).unwrap().publishers.len(), 1);
    assert!(wire.messages3().is_empty());

    // the other NT3 client sees an update with its own next sequence number
    server.send_outgoing(d, now_millis());
    match other_wire.messages3().as_slice() {
        [Message3::EntryUpdate { id, seq_num, value }] => {
            assert_eq!(*id, x_id);
            assert_eq!(*seq_num, 1);
            assert_eq!(value.data, ValueData::Double(4.0));
        }
        other => panic!("expected one entry update, got {other:?}"),
    }
}

#[test]
fn test_nt3_flags_update_sets_persistent() {
    let (mut server, _a, x_id) = server_with_x();
    let (_wire, c) = running_nt3(&mut server);
    send3(
        &mut server,
        c,
        &[Message3::FlagsUpdate {
            id: x_id,
            flags: FLAG_PERSISTENT,
        }],
    );
    let topic = server.storage().get_topic_by_name("/x").unwrap();
    assert!(topic.persistent);
    assert!(server.persistent_changed());
}

fn assign3(name: &str) -> Message3 {
    Message3::EntryAssign {
        name: name.into(),
        id: UNASSIGNED_ID,
        seq_num: 0,
        flags: 0,
        value: Value::boolean(true, 0),
    }
}

#[test]
fn test_nt3_entry_delete_removes_topic() {
    let mut server = ServerImpl::new();
    let (_wire, c) = running_nt3(&mut server);
    send3(&mut server, c, &[assign3("/a"), assign3("/b")]);
    let a_id = server.storage().find_topic("/a").unwrap() as u16;

    send3(&mut server, c, &[Message3::EntryDelete { id: a_id }]);
    assert!(server.storage().get_topic_by_name("/a").is_none());
    assert!(server.storage().get_topic_by_name("/b").is_some());
    assert_eq!(server.client(c).unwrap().publishers.len(), 1);
    assert!(decoder_error(&server, c).is_none());
}

#[test]
fn test_nt3_clear_entries_keeps_topics() {
    let mut server = ServerImpl::new();
    let (_wire, c) = running_nt3(&mut server);
    send3(&mut server, c, &[assign3("/b"), assign3("/c")]);

    send3(&mut server, c, &[Message3::ClearEntries]);
    assert!(decoder_error(&server, c).is_none());
    assert!(server.client(c).unwrap().publishers.is_empty());
    for name in ["/b", "/c"] {
        let topic = server.storage().get_topic_by_name(name).unwrap();
        assert_eq!(topic.publisher_count, 0);
        assert!(topic.retained);
        assert_eq!(last_value(&server, name), Some(ValueData::Boolean(true)));
    }
}

#[test]
fn test_nt3_clear_entries_reassigns_on_next_value() {
    let (mut server, a, x_id) = server_with_x();
    let (wire, c) = running_nt3(&mut server);

    send3(&mut server, c, &[Message3::ClearEntries]);
    set_value(&mut server, a, 1, &Value::double(2.0, 20));
    server.send_outgoing(c, now_millis());
    match wire.messages3().as_slice() {
        [Message3::EntryAssign { name, id, value, .. }] => {
            assert_eq!(name, "/x");
            assert_eq!(*id, x_id);
            assert_eq!(value.data, ValueData::Double(2.0));
        }
        other => panic!("expected one entry assign, got {other:?}"),
    }
}

#[test]
fn test_nt3_skips_topics_past_entry_id_range() {
    let wire = RecordingWire::new();
    let mut session = Session3::new(wire.boxed(), false, None);
    let big = ServerTopic::new(70_000, "/big", "double", Map::new(), false);
    session.send_value(&big, &Value::double(1.0, 1), ValueSendMode::Normal);
    assert_eq!(session.pending(), 0);

    let small = ServerTopic::new(7, "/small", "double", Map::new(), false);
    session.send_value(&small, &Value::double(1.0, 1), ValueSendMode::Normal);
    assert_eq!(session.pending(), 1);
}

#[test]
fn test_nt3_stalled_wire_disconnects() {
    let (mut server, a, _) = server_with_x();
    let (wire, c) = running_nt3(&mut server);

    set_value(&mut server, a, 1, &Value::double(2.0, 20));
    wire.set_ready(false);

    // recently flushed: just wait
    wire.log.lock().unwrap().last_flush_us = now_micros();
    server.send_outgoing(c, now_millis());
    assert!(wire.disconnect_reason().is_none());

    wire.log.lock().unwrap().last_flush_us = now_micros() - 2 * STALL_TIMEOUT_US;
    server.send_outgoing(c, now_millis() + 10);
    assert_eq!(wire.disconnect_reason().as_deref(), Some("transmit stalled"));
}

#[test]
fn test_nt3_client_removal_unpublishes() {
    let mut server = ServerImpl::new();
    let (_wire, c) = running_nt3(&mut server);
    send3(
        &mut server,
        c,
        &[Message3::EntryAssign {
            name: "/tmp".into(),
            id: UNASSIGNED_ID,
            seq_num: 0,
            flags: 0,
            value: Value::string("x", 0),
        }],
    );
    // retained, so it outlives its publisher
    server.remove_client(c);
    let topic = server.storage().get_topic_by_name("/tmp").unwrap();
    assert_eq!(topic.publisher_count, 0);
    assert!(topic.retained);
}
