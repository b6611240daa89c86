//! # ntserve
//!
//! `ntserve` is a NetworkTables server. NT4 clients connect over WebSockets,
//! legacy NT3 clients over plain TCP, and both see the same set of topics.
//! The server keeps the last value of each topic, fans values out to
//! subscribers at the rate they ask for and saves persistent topics to a
//! JSON file.
//!
//! ## Core Modules
//!
//! - `broker`: topics, values, meta topics and the `ServerImpl` coordinator
//!   that owns storage and the client table.
//! - `client`: per-connection session state for NT4, NT3 and the in-process
//!   local client, plus the outgoing queue.
//! - `config`: loading and managing server configuration.
//! - `persistence`: reading and writing the persistent topics file.
//! - `transport`: wire formats and the WebSocket and TCP listeners.
//! - `utils`: error types, logging setup and the clock.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
