//! Persistent topic file.
//!
//! Persistent topics are saved as a JSON array of
//! `{"name", "type", "value", "properties"}` objects. Raw-typed values are
//! base64 strings. Files are written to a temporary sibling and renamed
//! into place, keeping the previous file as `.bak`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::broker::value::{Value, ValueData};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub type_str: String,
    pub value: JsonValue,
    pub properties: Map<String, JsonValue>,
}

/// A validated entry, ready to become a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTopic {
    pub name: String,
    pub type_str: String,
    pub properties: Map<String, JsonValue>,
    pub value: Value,
}

pub fn value_to_json(value: &Value) -> JsonValue {
    match &value.data {
        ValueData::Boolean(v) => JsonValue::from(*v),
        ValueData::Double(v) => JsonValue::from(*v),
        ValueData::Float(v) => JsonValue::from(*v),
        ValueData::Integer(v) => JsonValue::from(*v),
        ValueData::String(v) => JsonValue::from(v.as_str()),
        ValueData::Raw(v) => JsonValue::from(BASE64.encode(v)),
        ValueData::BooleanArray(v) => JsonValue::from(v.clone()),
        ValueData::DoubleArray(v) => JsonValue::from(v.clone()),
        ValueData::FloatArray(v) => JsonValue::from(v.clone()),
        ValueData::IntegerArray(v) => JsonValue::from(v.clone()),
        ValueData::StringArray(v) => JsonValue::from(v.clone()),
    }
}

fn array_of<T>(
    value: &JsonValue,
    elem: impl Fn(&JsonValue) -> Option<T>,
    what: &str,
) -> Result<Vec<T>, String> {
    let items = value
        .as_array()
        .ok_or_else(|| "value type mismatch, expected array".to_string())?;
    items
        .iter()
        .map(|v| elem(v).ok_or_else(|| format!("array value type mismatch, expected {what}")))
        .collect()
}

/// Convert a JSON value of the given topic type. Unknown types are raw.
pub fn value_from_json(type_str: &str, value: &JsonValue, time: i64) -> Result<Value, String> {
    let mismatch = |what: &str| format!("value type mismatch, expected {what}");
    let data = match type_str {
        "boolean" => ValueData::Boolean(value.as_bool().ok_or_else(|| mismatch("boolean"))?),
        "int" => ValueData::Integer(
            value
                .as_i64()
                .or_else(|| value.as_u64().map(|v| v as i64))
                .ok_or_else(|| mismatch("int"))?,
        ),
        "float" => ValueData::Float(value.as_f64().ok_or_else(|| mismatch("float"))? as f32),
        "double" => ValueData::Double(value.as_f64().ok_or_else(|| mismatch("double"))?),
        "string" | "json" => ValueData::String(
            value
                .as_str()
                .ok_or_else(|| mismatch("string"))?
                .to_string(),
        ),
        "boolean[]" => ValueData::BooleanArray(array_of(value, JsonValue::as_bool, "boolean")?),
        "int[]" => ValueData::IntegerArray(array_of(
            value,
            |v| v.as_i64().or_else(|| v.as_u64().map(|u| u as i64)),
            "int",
        )?),
        "float[]" => {
            ValueData::FloatArray(array_of(value, |v| v.as_f64().map(|f| f as f32), "float")?)
        }
        "double[]" => ValueData::DoubleArray(array_of(value, JsonValue::as_f64, "double")?),
        "string[]" => ValueData::StringArray(array_of(
            value,
            |v| v.as_str().map(str::to_string),
            "string",
        )?),
        _ => {
            let encoded = value.as_str().ok_or_else(|| mismatch("base64 string"))?;
            ValueData::Raw(
                BASE64
                    .decode(encoded)
                    .map_err(|e| format!("invalid base64: {e}"))?,
            )
        }
    };
    Ok(Value::new(data, time))
}

pub fn parse_array(input: &str) -> Result<Vec<JsonValue>, String> {
    let doc: JsonValue =
        serde_json::from_str(input).map_err(|e| format!("could not decode JSON: {e}"))?;
    match doc {
        JsonValue::Array(items) => Ok(items),
        _ => Err("expected JSON array at top level".to_string()),
    }
}

/// Validate one element of the persistent array.
pub fn parse_entry(item: &JsonValue, time: i64) -> Result<LoadedTopic, String> {
    let obj = item
        .as_object()
        .ok_or_else(|| "expected JSON object".to_string())?;

    let name = obj
        .get("name")
        .ok_or_else(|| "no name key".to_string())?
        .as_str()
        .ok_or_else(|| "name must be a string".to_string())?;
    let type_str = obj
        .get("type")
        .ok_or_else(|| "no type key".to_string())?
        .as_str()
        .ok_or_else(|| "type must be a string".to_string())?;
    let value = obj
        .get("value")
        .ok_or_else(|| "no value key".to_string())?;
    let properties = obj
        .get("properties")
        .ok_or_else(|| "no properties key".to_string())?
        .as_object()
        .ok_or_else(|| "properties must be an object".to_string())?;

    let persistent = properties
        .get("persistent")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    if !persistent {
        return Err("persistent property not set".to_string());
    }

    Ok(LoadedTopic {
        name: name.to_string(),
        type_str: type_str.to_string(),
        properties: properties.clone(),
        value: value_from_json(type_str, value, time)?,
    })
}

pub fn dump(entries: &[PersistentEntry]) -> String {
    match serde_json::to_string_pretty(entries) {
        Ok(mut out) => {
            out.push('\n');
            out
        }
        // plain maps and strings always serialize
        Err(_) => "[]\n".to_string(),
    }
}

pub fn load_file(path: impl AsRef<Path>) -> io::Result<String> {
    fs::read_to_string(path)
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(ext);
    PathBuf::from(name)
}

/// Write atomically: `<path>.tmp`, then rotate the old file to `<path>.bak`.
pub fn save_file(path: impl AsRef<Path>, contents: &str) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = sibling(path, ".tmp");
    fs::write(&tmp, contents)?;
    if path.exists() {
        fs::rename(path, sibling(path, ".bak"))?;
    }
    fs::rename(&tmp, path)
}
