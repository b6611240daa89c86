//! NT4 binary value frames.
//!
//! A binary WebSocket frame holds one or more concatenated MessagePack
//! arrays of the form `[topic id, timestamp (us), type id, value]`. Topic id
//! -1 is the time-sync ping.

use std::fmt;
use std::io::Cursor;

use serde::de::{self, DeserializeSeed, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Deserializer, Serialize};

use crate::broker::value::{Value, ValueData, type_id};
use crate::utils::error::DecodeError;

/// Topic id clients use for the time-sync ping.
pub const PING_ID: i64 = -1;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueFrame {
    pub id: i64,
    pub value: Value,
}

struct FrameRef<'a> {
    id: i64,
    value: &'a Value,
}

struct DataRef<'a>(&'a ValueData);

struct Bytes<'a>(&'a [u8]);

impl Serialize for Bytes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

impl Serialize for FrameRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(4)?;
        tup.serialize_element(&self.id)?;
        tup.serialize_element(&self.value.time)?;
        tup.serialize_element(&self.value.type_id())?;
        tup.serialize_element(&DataRef(&self.value.data))?;
        tup.end()
    }
}

impl Serialize for DataRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            ValueData::Boolean(v) => serializer.serialize_bool(*v),
            ValueData::Double(v) => serializer.serialize_f64(*v),
            ValueData::Float(v) => serializer.serialize_f32(*v),
            ValueData::Integer(v) => serializer.serialize_i64(*v),
            ValueData::String(v) => serializer.serialize_str(v),
            ValueData::Raw(v) => Bytes(v).serialize(serializer),
            ValueData::BooleanArray(v) => serializer.collect_seq(v),
            ValueData::DoubleArray(v) => serializer.collect_seq(v),
            ValueData::FloatArray(v) => serializer.collect_seq(v),
            ValueData::IntegerArray(v) => serializer.collect_seq(v),
            ValueData::StringArray(v) => serializer.collect_seq(v),
        }
    }
}

/// Raw payloads may arrive as msgpack bin or as an array of small ints.
struct RawBytes(Vec<u8>);

impl<'de> Deserialize<'de> for RawBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawVisitor;

        impl<'de> Visitor<'de> for RawVisitor {
            type Value = RawBytes;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("binary data")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<RawBytes, E> {
                Ok(RawBytes(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<RawBytes, E> {
                Ok(RawBytes(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<RawBytes, E> {
                Ok(RawBytes(v.as_bytes().to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RawBytes, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(RawBytes(out))
            }
        }

        deserializer.deserialize_any(RawVisitor)
    }
}

/// Deserializes the value element once the type id is known.
struct DataSeed(u8);

impl<'de> DeserializeSeed<'de> for DataSeed {
    type Value = ValueData;

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> Result<ValueData, D::Error> {
        Ok(match self.0 {
            type_id::BOOLEAN => ValueData::Boolean(bool::deserialize(d)?),
            type_id::DOUBLE => ValueData::Double(f64::deserialize(d)?),
            type_id::INTEGER => ValueData::Integer(i64::deserialize(d)?),
            type_id::FLOAT => ValueData::Float(f32::deserialize(d)?),
            type_id::STRING => ValueData::String(String::deserialize(d)?),
            type_id::RAW => ValueData::Raw(RawBytes::deserialize(d)?.0),
            type_id::BOOLEAN_ARRAY => ValueData::BooleanArray(Vec::deserialize(d)?),
            type_id::DOUBLE_ARRAY => ValueData::DoubleArray(Vec::deserialize(d)?),
            type_id::INTEGER_ARRAY => ValueData::IntegerArray(Vec::deserialize(d)?),
            type_id::FLOAT_ARRAY => ValueData::FloatArray(Vec::deserialize(d)?),
            type_id::STRING_ARRAY => ValueData::StringArray(Vec::deserialize(d)?),
            other => return Err(de::Error::custom(DecodeError::UnknownType(other))),
        })
    }
}

impl<'de> Deserialize<'de> for ValueFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor;

        impl<'de> Visitor<'de> for FrameVisitor {
            type Value = ValueFrame;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an array of [id, timestamp, type, value]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ValueFrame, A::Error> {
                let id: i64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let time: i64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let type_id: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let data = seq
                    .next_element_seed(DataSeed(type_id))?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                Ok(ValueFrame {
                    id,
                    value: Value::new(data, time),
                })
            }
        }

        deserializer.deserialize_seq(FrameVisitor)
    }
}

pub fn encode_frame(id: i64, value: &Value) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(&FrameRef { id, value })
}

/// Decode every frame in `data`. Frames decoded before a bad one are
/// returned alongside the error.
pub fn decode_frames(data: &[u8]) -> (Vec<ValueFrame>, Option<DecodeError>) {
    let mut frames = Vec::new();
    let mut cursor = Cursor::new(data);
    while (cursor.position() as usize) < data.len() {
        match rmp_serde::from_read::<_, ValueFrame>(&mut cursor) {
            Ok(frame) => frames.push(frame),
            Err(e) => return (frames, Some(DecodeError::Binary(e.to_string()))),
        }
    }
    (frames, None)
}
