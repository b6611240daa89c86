//! NT3 (protocol revision 3.0) binary stream codec.
//!
//! NT3 runs over a raw TCP stream, so messages can be split across reads.
//! `WireDecoder3` buffers partial input and yields whole messages. The first
//! malformed byte makes the decoder's error sticky; the session disconnects
//! with it.

use crate::broker::value::{Value, ValueData};
use crate::utils::error::DecodeError;

pub const PROTO_REV: u16 = 0x0300;
/// Entry id a client uses when asking the server to assign one.
pub const UNASSIGNED_ID: u16 = 0xFFFF;
pub const CLEAR_ALL_MAGIC: u32 = 0xD06C_B27A;
/// Flag bit for persistent entries.
pub const FLAG_PERSISTENT: u8 = 0x01;

mod msg_type {
    pub const KEEP_ALIVE: u8 = 0x00;
    pub const CLIENT_HELLO: u8 = 0x01;
    pub const PROTO_UNSUP: u8 = 0x02;
    pub const SERVER_HELLO_DONE: u8 = 0x03;
    pub const SERVER_HELLO: u8 = 0x04;
    pub const CLIENT_HELLO_DONE: u8 = 0x05;
    pub const ENTRY_ASSIGN: u8 = 0x10;
    pub const ENTRY_UPDATE: u8 = 0x11;
    pub const FLAGS_UPDATE: u8 = 0x12;
    pub const ENTRY_DELETE: u8 = 0x13;
    pub const CLEAR_ENTRIES: u8 = 0x14;
    pub const EXECUTE_RPC: u8 = 0x20;
    pub const RPC_RESPONSE: u8 = 0x21;
}

mod value_type {
    pub const BOOLEAN: u8 = 0x00;
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const RAW: u8 = 0x03;
    pub const BOOLEAN_ARRAY: u8 = 0x10;
    pub const DOUBLE_ARRAY: u8 = 0x11;
    pub const STRING_ARRAY: u8 = 0x12;
    pub const RPC: u8 = 0x20;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message3 {
    KeepAlive,
    ClientHello {
        proto_rev: u16,
        self_id: String,
    },
    ProtoUnsup {
        proto_rev: u16,
    },
    ServerHelloDone,
    ServerHello {
        flags: u8,
        self_id: String,
    },
    ClientHelloDone,
    EntryAssign {
        name: String,
        id: u16,
        seq_num: u16,
        flags: u8,
        value: Value,
    },
    EntryUpdate {
        id: u16,
        seq_num: u16,
        value: Value,
    },
    FlagsUpdate {
        id: u16,
        flags: u8,
    },
    EntryDelete {
        id: u16,
    },
    ClearEntries,
    ExecuteRpc {
        id: u16,
        uid: u16,
        params: Vec<u8>,
    },
    RpcResponse {
        id: u16,
        uid: u16,
        result: Vec<u8>,
    },
}

enum Fail {
    Incomplete,
    Bad(DecodeError),
}

type Decoded<T> = Result<T, Fail>;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Decoded<&'a [u8]> {
        let data: &'a [u8] = self.data;
        let end = self.pos.checked_add(n).ok_or(Fail::Incomplete)?;
        let out = data.get(self.pos..end).ok_or(Fail::Incomplete)?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Decoded<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Decoded<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Decoded<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Decoded<f64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_be_bytes(raw))
    }

    fn uleb128(&mut self) -> Decoded<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            if shift >= 64 {
                return Err(Fail::Bad(DecodeError::Protocol("LEB128 overflow".into())));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn blob(&mut self) -> Decoded<Vec<u8>> {
        let len = self.uleb128()?;
        let len = usize::try_from(len).map_err(|_| Fail::Incomplete)?;
        Ok(self.bytes(len)?.to_vec())
    }

    fn string(&mut self) -> Decoded<String> {
        Ok(String::from_utf8_lossy(&self.blob()?).into_owned())
    }

    fn value(&mut self, ty: u8) -> Decoded<ValueData> {
        Ok(match ty {
            value_type::BOOLEAN => ValueData::Boolean(self.u8()? != 0),
            value_type::DOUBLE => ValueData::Double(self.f64()?),
            value_type::STRING => ValueData::String(self.string()?),
            value_type::RAW | value_type::RPC => ValueData::Raw(self.blob()?),
            value_type::BOOLEAN_ARRAY => {
                let n = self.u8()?;
                let mut v = Vec::with_capacity(n.into());
                for _ in 0..n {
                    v.push(self.u8()? != 0);
                }
                ValueData::BooleanArray(v)
            }
            value_type::DOUBLE_ARRAY => {
                let n = self.u8()?;
                let mut v = Vec::with_capacity(n.into());
                for _ in 0..n {
                    v.push(self.f64()?);
                }
                ValueData::DoubleArray(v)
            }
            value_type::STRING_ARRAY => {
                let n = self.u8()?;
                let mut v = Vec::with_capacity(n.into());
                for _ in 0..n {
                    v.push(self.string()?);
                }
                ValueData::StringArray(v)
            }
            other => return Err(Fail::Bad(DecodeError::UnknownType(other))),
        })
    }

    fn message(&mut self) -> Decoded<Message3> {
        Ok(match self.u8()? {
            msg_type::KEEP_ALIVE => Message3::KeepAlive,
            msg_type::CLIENT_HELLO => {
                let proto_rev = self.u16()?;
                let self_id = if proto_rev >= PROTO_REV {
                    self.string()?
                } else {
                    String::new()
                };
                Message3::ClientHello { proto_rev, self_id }
            }
            msg_type::PROTO_UNSUP => Message3::ProtoUnsup {
                proto_rev: self.u16()?,
            },
            msg_type::SERVER_HELLO_DONE => Message3::ServerHelloDone,
            msg_type::SERVER_HELLO => Message3::ServerHello {
                flags: self.u8()?,
                self_id: self.string()?,
            },
            msg_type::CLIENT_HELLO_DONE => Message3::ClientHelloDone,
            msg_type::ENTRY_ASSIGN => {
                let name = self.string()?;
                let ty = self.u8()?;
                let id = self.u16()?;
                let seq_num = self.u16()?;
                let flags = self.u8()?;
                let value = Value::new(self.value(ty)?, 0);
                Message3::EntryAssign {
                    name,
                    id,
                    seq_num,
                    flags,
                    value,
                }
            }
            msg_type::ENTRY_UPDATE => {
                let id = self.u16()?;
                let seq_num = self.u16()?;
                let ty = self.u8()?;
                let value = Value::new(self.value(ty)?, 0);
                Message3::EntryUpdate { id, seq_num, value }
            }
            msg_type::FLAGS_UPDATE => Message3::FlagsUpdate {
                id: self.u16()?,
                flags: self.u8()?,
            },
            msg_type::ENTRY_DELETE => Message3::EntryDelete { id: self.u16()? },
            msg_type::CLEAR_ENTRIES => {
                let magic = self.u32()?;
                if magic != CLEAR_ALL_MAGIC {
                    return Err(Fail::Bad(DecodeError::Protocol(format!(
                        "bad clear entries magic 0x{magic:08x}"
                    ))));
                }
                Message3::ClearEntries
            }
            msg_type::EXECUTE_RPC => Message3::ExecuteRpc {
                id: self.u16()?,
                uid: self.u16()?,
                params: self.blob()?,
            },
            msg_type::RPC_RESPONSE => Message3::RpcResponse {
                id: self.u16()?,
                uid: self.u16()?,
                result: self.blob()?,
            },
            other => return Err(Fail::Bad(DecodeError::UnknownMessage3(other))),
        })
    }
}

/// Streaming decoder for one NT3 connection.
#[derive(Debug, Default)]
pub struct WireDecoder3 {
    buf: Vec<u8>,
    error: Option<DecodeError>,
}

impl WireDecoder3 {
    /// Append `data` and return every message it completes. After an error
    /// the decoder yields nothing further; check `error()`.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Message3> {
        if self.error.is_some() {
            return Vec::new();
        }
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        let mut consumed = 0;
        while consumed < self.buf.len() {
            let mut reader = Reader::new(&self.buf[consumed..]);
            match reader.message() {
                Ok(msg) => {
                    consumed += reader.pos;
                    out.push(msg);
                }
                Err(Fail::Incomplete) => break,
                Err(Fail::Bad(e)) => {
                    self.error = Some(e);
                    self.buf.clear();
                    return out;
                }
            }
        }
        self.buf.drain(..consumed);
        out
    }

    pub fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(DecodeError::Protocol(error.into()));
        }
    }
}

fn write_uleb128(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_blob(out: &mut Vec<u8>, data: &[u8]) {
    write_uleb128(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_blob(out, s.as_bytes());
}

/// NT3 has no integer or float types; those travel as doubles.
pub fn value_type3(data: &ValueData) -> u8 {
    match data {
        ValueData::Boolean(_) => value_type::BOOLEAN,
        ValueData::Double(_) | ValueData::Float(_) | ValueData::Integer(_) => value_type::DOUBLE,
        ValueData::String(_) => value_type::STRING,
        ValueData::Raw(_) => value_type::RAW,
        ValueData::BooleanArray(_) => value_type::BOOLEAN_ARRAY,
        ValueData::DoubleArray(_) | ValueData::FloatArray(_) | ValueData::IntegerArray(_) => {
            value_type::DOUBLE_ARRAY
        }
        ValueData::StringArray(_) => value_type::STRING_ARRAY,
    }
}

fn write_array<T>(out: &mut Vec<u8>, items: &[T], mut each: impl FnMut(&mut Vec<u8>, &T)) {
    let n = items.len().min(usize::from(u8::MAX));
    out.push(n as u8);
    for item in &items[..n] {
        each(out, item);
    }
}

fn write_value(out: &mut Vec<u8>, data: &ValueData) {
    match data {
        ValueData::Boolean(v) => out.push(u8::from(*v)),
        ValueData::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
        ValueData::Float(v) => out.extend_from_slice(&f64::from(*v).to_be_bytes()),
        ValueData::Integer(v) => out.extend_from_slice(&(*v as f64).to_be_bytes()),
        ValueData::String(v) => write_string(out, v),
        ValueData::Raw(v) => write_blob(out, v),
        ValueData::BooleanArray(v) => write_array(out, v, |o, b| o.push(u8::from(*b))),
        ValueData::DoubleArray(v) => {
            write_array(out, v, |o, d| o.extend_from_slice(&d.to_be_bytes()))
        }
        ValueData::FloatArray(v) => write_array(out, v, |o, f| {
            o.extend_from_slice(&f64::from(*f).to_be_bytes())
        }),
        ValueData::IntegerArray(v) => write_array(out, v, |o, i| {
            o.extend_from_slice(&(*i as f64).to_be_bytes())
        }),
        ValueData::StringArray(v) => write_array(out, v, |o, s| write_string(o, s)),
    }
}

pub fn encode(out: &mut Vec<u8>, msg: &Message3) {
    match msg {
        Message3::KeepAlive => out.push(msg_type::KEEP_ALIVE),
        Message3::ClientHello { proto_rev, self_id } => {
            out.push(msg_type::CLIENT_HELLO);
            out.extend_from_slice(&proto_rev.to_be_bytes());
            if *proto_rev >= PROTO_REV {
                write_string(out, self_id);
            }
        }
        Message3::ProtoUnsup { proto_rev } => {
            out.push(msg_type::PROTO_UNSUP);
            out.extend_from_slice(&proto_rev.to_be_bytes());
        }
        Message3::ServerHelloDone => out.push(msg_type::SERVER_HELLO_DONE),
        Message3::ServerHello { flags, self_id } => {
            out.push(msg_type::SERVER_HELLO);
            out.push(*flags);
            write_string(out, self_id);
        }
        Message3::ClientHelloDone => out.push(msg_type::CLIENT_HELLO_DONE),
        Message3::EntryAssign {
            name,
            id,
            seq_num,
            flags,
            value,
        } => {
            out.push(msg_type::ENTRY_ASSIGN);
            write_string(out, name);
            out.push(value_type3(&value.data));
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&seq_num.to_be_bytes());
            out.push(*flags);
            write_value(out, &value.data);
        }
        Message3::EntryUpdate { id, seq_num, value } => {
            out.push(msg_type::ENTRY_UPDATE);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&seq_num.to_be_bytes());
            out.push(value_type3(&value.data));
            write_value(out, &value.data);
        }
        Message3::FlagsUpdate { id, flags } => {
            out.push(msg_type::FLAGS_UPDATE);
            out.extend_from_slice(&id.to_be_bytes());
            out.push(*flags);
        }
        Message3::EntryDelete { id } => {
            out.push(msg_type::ENTRY_DELETE);
            out.extend_from_slice(&id.to_be_bytes());
        }
        Message3::ClearEntries => {
            out.push(msg_type::CLEAR_ENTRIES);
            out.extend_from_slice(&CLEAR_ALL_MAGIC.to_be_bytes());
        }
        Message3::ExecuteRpc { id, uid, params } => {
            out.push(msg_type::EXECUTE_RPC);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&uid.to_be_bytes());
            write_blob(out, params);
        }
        Message3::RpcResponse { id, uid, result } => {
            out.push(msg_type::RPC_RESPONSE);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&uid.to_be_bytes());
            write_blob(out, result);
        }
    }
}

/// Encode a batch into one buffer.
pub fn encode_all<'a>(msgs: impl IntoIterator<Item = &'a Message3>) -> Vec<u8> {
    let mut out = Vec::new();
    for msg in msgs {
        encode(&mut out, msg);
    }
    out
}
