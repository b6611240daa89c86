//! Typed topic values.
//!
//! A `Value` is a payload plus the microsecond timestamp it was produced at.
//! Timestamps drive the last-writer-wins rule in storage and the coalescing
//! rule in the outgoing queue; a timestamp of 0 means "not supplied".

/// NT4 binary type ids.
pub mod type_id {
    pub const BOOLEAN: u8 = 0;
    pub const DOUBLE: u8 = 1;
    pub const INTEGER: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const STRING: u8 = 4;
    pub const RAW: u8 = 5;
    pub const BOOLEAN_ARRAY: u8 = 16;
    pub const DOUBLE_ARRAY: u8 = 17;
    pub const INTEGER_ARRAY: u8 = 18;
    pub const FLOAT_ARRAY: u8 = 19;
    pub const STRING_ARRAY: u8 = 20;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    Boolean(bool),
    Double(f64),
    Float(f32),
    Integer(i64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    FloatArray(Vec<f32>),
    IntegerArray(Vec<i64>),
    StringArray(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub data: ValueData,
    pub time: i64,
}

impl Value {
    pub fn new(data: ValueData, time: i64) -> Self {
        Self { data, time }
    }

    pub fn boolean(v: bool, time: i64) -> Self {
        Self::new(ValueData::Boolean(v), time)
    }

    pub fn double(v: f64, time: i64) -> Self {
        Self::new(ValueData::Double(v), time)
    }

    pub fn integer(v: i64, time: i64) -> Self {
        Self::new(ValueData::Integer(v), time)
    }

    pub fn string(v: impl Into<String>, time: i64) -> Self {
        Self::new(ValueData::String(v.into()), time)
    }

    pub fn raw(v: Vec<u8>, time: i64) -> Self {
        Self::new(ValueData::Raw(v), time)
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    /// NT4 wire type id of this value.
    pub fn type_id(&self) -> u8 {
        match &self.data {
            ValueData::Boolean(_) => type_id::BOOLEAN,
            ValueData::Double(_) => type_id::DOUBLE,
            ValueData::Float(_) => type_id::FLOAT,
            ValueData::Integer(_) => type_id::INTEGER,
            ValueData::String(_) => type_id::STRING,
            ValueData::Raw(_) => type_id::RAW,
            ValueData::BooleanArray(_) => type_id::BOOLEAN_ARRAY,
            ValueData::DoubleArray(_) => type_id::DOUBLE_ARRAY,
            ValueData::FloatArray(_) => type_id::FLOAT_ARRAY,
            ValueData::IntegerArray(_) => type_id::INTEGER_ARRAY,
            ValueData::StringArray(_) => type_id::STRING_ARRAY,
        }
    }

    /// Default type string for this value when the publisher did not
    /// name one (NT3 publishes).
    pub fn type_str(&self) -> &'static str {
        match &self.data {
            ValueData::Boolean(_) => "boolean",
            ValueData::Double(_) => "double",
            ValueData::Float(_) => "float",
            ValueData::Integer(_) => "int",
            ValueData::String(_) => "string",
            ValueData::Raw(_) => "raw",
            ValueData::BooleanArray(_) => "boolean[]",
            ValueData::DoubleArray(_) => "double[]",
            ValueData::FloatArray(_) => "float[]",
            ValueData::IntegerArray(_) => "int[]",
            ValueData::StringArray(_) => "string[]",
        }
    }

    /// Rough encoded size, used for outgoing queue accounting.
    pub fn approx_size(&self) -> usize {
        let payload = match &self.data {
            ValueData::Boolean(_) => 1,
            ValueData::Double(_) | ValueData::Integer(_) => 9,
            ValueData::Float(_) => 5,
            ValueData::String(s) => s.len() + 5,
            ValueData::Raw(v) => v.len() + 5,
            ValueData::BooleanArray(v) => v.len() + 5,
            ValueData::DoubleArray(v) => v.len() * 9 + 5,
            ValueData::FloatArray(v) => v.len() * 5 + 5,
            ValueData::IntegerArray(v) => v.len() * 9 + 5,
            ValueData::StringArray(v) => v.iter().map(|s| s.len() + 5).sum::<usize>() + 5,
        };
        // array header, id, timestamp, type
        payload + 1 + 5 + 9 + 1
    }
}

/// NT4 type id a topic type string is carried as on the wire. Anything that
/// is not a known scalar or array type travels as raw bytes.
pub fn type_id_for_str(type_str: &str) -> u8 {
    match type_str {
        "boolean" => type_id::BOOLEAN,
        "double" => type_id::DOUBLE,
        "int" => type_id::INTEGER,
        "float" => type_id::FLOAT,
        "string" | "json" => type_id::STRING,
        "boolean[]" => type_id::BOOLEAN_ARRAY,
        "double[]" => type_id::DOUBLE_ARRAY,
        "int[]" => type_id::INTEGER_ARRAY,
        "float[]" => type_id::FLOAT_ARRAY,
        "string[]" => type_id::STRING_ARRAY,
        _ => type_id::RAW,
    }
}
