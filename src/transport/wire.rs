//! The connection abstraction sessions write to.
//!
//! Sessions never touch sockets. They write through a `WireConnection`,
//! which for real connections is a `ChannelWire`: frames go into a tokio
//! channel drained by the connection's writer task, the same split the
//! websocket loop has always used. Text messages written between flushes are
//! batched into one JSON array frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use tokio::sync::{Notify, mpsc};

use crate::utils::error::TransportError;
use crate::utils::time::now_micros;

/// Byte/message sink for one client connection.
///
/// The write methods return how many trailing messages were *not* actually
/// handed off (0 when everything went through).
pub trait WireConnection: Send {
    fn ready(&self) -> bool;
    fn write_text(&mut self, text: String) -> Result<usize, TransportError>;
    fn write_binary(&mut self, data: Vec<u8>) -> Result<usize, TransportError>;
    fn flush(&mut self) -> Result<usize, TransportError>;
    fn stop_read(&mut self);
    fn start_read(&mut self);
    fn disconnect(&mut self, reason: &str);
    /// Microsecond timestamp of the last time data actually left.
    fn last_flush_time(&self) -> i64;
}

/// What the writer task receives.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Close(String),
}

/// Shared between a `ChannelWire` and its writer task.
#[derive(Debug)]
pub struct FrameTracker {
    in_flight: AtomicUsize,
    last_sent_us: AtomicI64,
}

impl FrameTracker {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last_sent_us: AtomicI64::new(now_micros()),
        }
    }

    /// Called by the writer task after each frame goes out.
    pub fn sent(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.last_sent_us.store(now_micros(), Ordering::SeqCst);
    }
}

/// Lets the session pause the connection's reader.
#[derive(Debug, Clone, Default)]
pub struct ReadGate {
    paused: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ReadGate {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Resolves once reading is allowed.
    pub async fn wait(&self) {
        while self.is_paused() {
            self.notify.notified().await;
        }
    }
}

pub struct ChannelWire {
    tx: mpsc::UnboundedSender<WireFrame>,
    text: Vec<String>,
    binary: Vec<u8>,
    tracker: Arc<FrameTracker>,
    gate: ReadGate,
    max_in_flight: usize,
    closed: bool,
}

impl ChannelWire {
    pub fn new(tx: mpsc::UnboundedSender<WireFrame>, max_in_flight: usize) -> Self {
        Self {
            tx,
            text: Vec::new(),
            binary: Vec::new(),
            tracker: Arc::new(FrameTracker::new()),
            gate: ReadGate::default(),
            max_in_flight: max_in_flight.max(1),
            closed: false,
        }
    }

    pub fn tracker(&self) -> Arc<FrameTracker> {
        self.tracker.clone()
    }

    pub fn read_gate(&self) -> ReadGate {
        self.gate.clone()
    }

    fn push(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)?;
        self.tracker.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush_text(&mut self) -> Result<(), TransportError> {
        if self.text.is_empty() {
            return Ok(());
        }
        let frame = format!("[{}]", self.text.join(","));
        self.text.clear();
        self.push(WireFrame::Text(frame))
    }

    fn flush_binary(&mut self) -> Result<(), TransportError> {
        if self.binary.is_empty() {
            return Ok(());
        }
        let frame = std::mem::take(&mut self.binary);
        self.push(WireFrame::Binary(frame))
    }
}

impl WireConnection for ChannelWire {
    fn ready(&self) -> bool {
        !self.closed && self.tracker.in_flight.load(Ordering::SeqCst) < self.max_in_flight
    }

    fn write_text(&mut self, text: String) -> Result<usize, TransportError> {
        self.flush_binary()?;
        self.text.push(text);
        Ok(0)
    }

    fn write_binary(&mut self, data: Vec<u8>) -> Result<usize, TransportError> {
        self.flush_text()?;
        self.binary.extend_from_slice(&data);
        Ok(0)
    }

    fn flush(&mut self) -> Result<usize, TransportError> {
        self.flush_text()?;
        self.flush_binary()?;
        Ok(0)
    }

    fn stop_read(&mut self) {
        self.gate.pause();
    }

    fn start_read(&mut self) {
        self.gate.resume();
    }

    fn disconnect(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        let _ = self.flush();
        let _ = self.tx.send(WireFrame::Close(reason.to_string()));
        self.closed = true;
        // a paused reader must wake up to notice the close
        self.gate.resume();
    }

    fn last_flush_time(&self) -> i64 {
        self.tracker.last_sent_us.load(Ordering::SeqCst)
    }
}
