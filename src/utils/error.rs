//! The `error` module defines custom error types used within the `ntserve` application.
//!
//! Storage and session operations never fail outward: a misbehaving client is
//! logged and ignored, or disconnected with a reason string. The types here
//! cover the places where a `Result` does cross a boundary: wire decoding,
//! the transport layer and process startup.

use thiserror::Error;

/// A frame or stream that could not be decoded. The message doubles as the
/// disconnect reason sent to the peer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("could not decode JSON message: {0}")]
    Json(String),
    #[error("binary decode error: {0}")]
    Binary(String),
    #[error("unknown value type {0}")]
    UnknownType(u8),
    #[error("unknown NT3 message type 0x{0:02x}")]
    UnknownMessage3(u8),
    #[error("{0}")]
    Protocol(String),
}

/// Failures raised by the socket side of a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top level error for running the server binary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistent file {path}: {errors}")]
    Persistent { path: String, errors: String },
}
