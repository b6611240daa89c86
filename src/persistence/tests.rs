use std::fs;
use std::sync::{Arc, Mutex};

use serde_json::{Map, json};
use tempfile::tempdir;

use super::json_store::{self, PersistentEntry};
use super::{check, load_into, save_if_changed};
use crate::broker::ServerImpl;
use crate::broker::value::{Value, ValueData};
use crate::client::LocalRequest;
use crate::transport::message::ClientMessage;

fn persistent_props() -> Map<String, serde_json::Value> {
    let mut props = Map::new();
    props.insert("persistent".into(), json!(true));
    props
}

fn publish_persistent(server: &mut ServerImpl, pubuid: i64, name: &str, value: Value) {
    server.handle_local(vec![
        LocalRequest::Control(ClientMessage::Publish {
            name: name.to_string(),
            pubuid,
            type_str: value.type_str().to_string(),
            properties: persistent_props(),
        }),
        LocalRequest::SetValue { pubuid, value },
    ]);
}

#[test]
fn test_value_json_conversions() {
    let raw = Value::raw(vec![1, 2, 3], 5);
    let encoded = json_store::value_to_json(&raw);
    assert_eq!(encoded, json!("AQID"));
    assert_eq!(json_store::value_from_json("raw", &encoded, 5).unwrap(), raw);

    let ints = json_store::value_from_json("int[]", &json!([1, 2, 3]), 0).unwrap();
    assert_eq!(ints.data, ValueData::IntegerArray(vec![1, 2, 3]));

    // ints are fine where a double is expected
    let d = json_store::value_from_json("double", &json!(3), 0).unwrap();
    assert_eq!(d.data, ValueData::Double(3.0));
}

#[test]
fn test_value_from_json_type_mismatch() {
    let err = json_store::value_from_json("boolean", &json!("yes"), 0).unwrap_err();
    assert!(err.contains("expected boolean"));

    let err = json_store::value_from_json("string[]", &json!(["a", 1]), 0).unwrap_err();
    assert!(err.contains("array value type mismatch"));

    let err = json_store::value_from_json("raw", &json!("%%%"), 0).unwrap_err();
    assert!(err.contains("base64"));
}

#[test]
fn test_parse_entry_requires_persistent() {
    let item = json!({
        "name": "/a",
        "type": "double",
        "value": 1.5,
        "properties": {"retained": true}
    });
    assert_eq!(
        json_store::parse_entry(&item, 0).unwrap_err(),
        "persistent property not set"
    );

    let item = json!({"name": "/a", "type": "double", "value": 1.5});
    assert_eq!(json_store::parse_entry(&item, 0).unwrap_err(), "no properties key");
}

#[test]
fn test_dump_is_pretty_json_array() {
    let entries = vec![PersistentEntry {
        name: "/x".into(),
        type_str: "string".into(),
        value: json!("hi"),
        properties: persistent_props(),
    }];
    let out = json_store::dump(&entries);
    assert!(out.ends_with('\n'));
    let parsed = json_store::parse_array(&out).unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0]["type"], json!("string"));
}

#[test]
fn test_save_file_keeps_backup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("networktables.json");

    json_store::save_file(&path, "[]\n").unwrap();
    json_store::save_file(&path, "[1]\n").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "[1]\n");
    assert_eq!(
        fs::read_to_string(dir.path().join("networktables.json.bak")).unwrap(),
        "[]\n"
    );
    assert!(!dir.path().join("networktables.json.tmp").exists());
}

#[test]
fn test_missing_file_loads_nothing() {
    let dir = tempdir().unwrap();
    let server = Arc::new(Mutex::new(ServerImpl::new()));
    let errors = load_into(&server, &dir.path().join("absent.json")).unwrap();
    assert!(errors.is_empty());
}

#[test]
fn test_save_and_reload_through_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nt.json");

    let server = Arc::new(Mutex::new(ServerImpl::new()));
    {
        let mut s = server.lock().unwrap();
        publish_persistent(&mut s, 1, "/pref/speed", Value::double(2.5, 10));
        publish_persistent(&mut s, 2, "/pref/name", Value::string("robot", 10));
    }

    assert!(save_if_changed(&server, &path).unwrap());
    // nothing changed since
    assert!(!save_if_changed(&server, &path).unwrap());

    let restored = Arc::new(Mutex::new(ServerImpl::new()));
    let errors = load_into(&restored, &path).unwrap();
    assert!(errors.is_empty(), "{errors}");

    let s = restored.lock().unwrap();
    let speed = s.storage().get_topic_by_name("/pref/speed").unwrap();
    assert_eq!(speed.type_str, "double");
    assert!(speed.persistent);
    assert_eq!(
        speed.last_value.as_ref().map(|v| v.data.clone()),
        Some(ValueData::Double(2.5))
    );
    let name = s.storage().get_topic_by_name("/pref/name").unwrap();
    assert_eq!(
        name.last_value.as_ref().map(|v| v.data.clone()),
        Some(ValueData::String("robot".into()))
    );
}

#[test]
fn test_failed_save_is_retried() {
    let dir = tempdir().unwrap();
    let server = Arc::new(Mutex::new(ServerImpl::new()));
    publish_persistent(
        &mut server.lock().unwrap(),
        1,
        "/pref/speed",
        Value::double(2.5, 10),
    );

    let unwritable = dir.path().join("missing").join("nt.json");
    assert!(save_if_changed(&server, &unwritable).is_err());

    let path = dir.path().join("nt.json");
    assert!(save_if_changed(&server, &path).unwrap());
    let saved = fs::read_to_string(&path).unwrap();
    assert!(saved.contains("/pref/speed"));
    assert!(!save_if_changed(&server, &path).unwrap());
}

#[test]
fn test_load_reports_bad_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nt.json");
    let contents = json!([
        {"name": "/ok", "type": "int", "value": 4, "properties": {"persistent": true}},
        {"name": "/bad", "type": "int", "value": "four", "properties": {"persistent": true}},
        "not an object"
    ]);
    fs::write(&path, contents.to_string()).unwrap();

    let server = Arc::new(Mutex::new(ServerImpl::new()));
    let errors = load_into(&server, &path).unwrap();
    assert_eq!(
        errors,
        "1: value type mismatch, expected int\n2: expected JSON object\n"
    );

    let mut s = server.lock().unwrap();
    assert!(s.storage().get_topic_by_name("/ok").is_some());
    assert!(s.storage().get_topic_by_name("/bad").is_none());
    // loading does not count as a change
    assert!(!s.persistent_changed());
}

#[test]
fn test_check_counts_usable_entries() {
    let input = json!([
        {"name": "/a", "type": "boolean", "value": true, "properties": {"persistent": true}},
        {"name": "/b", "type": "double[]", "value": [1, "x"], "properties": {"persistent": true}},
        {"type": "int", "value": 1, "properties": {"persistent": true}}
    ])
    .to_string();
    let (usable, errors) = check(&input);
    assert_eq!(usable, 1);
    assert_eq!(errors.lines().count(), 2);
    assert!(errors.starts_with("1: "));
    assert!(errors.contains("2: no name key"));

    let (usable, errors) = check("{}");
    assert_eq!(usable, 0);
    assert_eq!(errors, "expected JSON array at top level\n");
}
