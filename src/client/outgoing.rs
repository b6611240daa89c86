//! Outgoing queue for NT4 sessions.
//!
//! Messages are bucketed by send period. Every topic id maps to one bucket;
//! control messages (announce, unannounce, properties) and values for a topic
//! share that bucket so a client never sees a value before its announce.
//! Values sent in `Normal` mode coalesce: while a value for a topic is still
//! pending, a newer one overwrites it in place.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::broker::topic::{TopicId, ValueSendMode};
use crate::broker::value::Value;
use crate::transport::codec::encode_frame;
use crate::transport::message::ServerMessage;
use crate::transport::wire::WireConnection;

/// Smallest period a bucket or subscriber may use.
pub const MIN_PERIOD_MS: u32 = 5;
/// Period used for topics until a subscriber says otherwise.
pub const DEFAULT_PERIOD_MS: u32 = 100;
/// Above this many queued bytes, `All` sends degrade to `Normal`.
pub const OUTGOING_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    Control(ServerMessage),
    Value(Value),
}

impl OutgoingMessage {
    fn size(&self) -> usize {
        match self {
            OutgoingMessage::Control(msg) => msg.approx_size(),
            OutgoingMessage::Value(value) => value.approx_size(),
        }
    }
}

#[derive(Debug)]
struct QueuedMessage {
    id: TopicId,
    msg: OutgoingMessage,
    size: usize,
}

#[derive(Debug)]
struct Queue {
    period_ms: u32,
    next_send_ms: u64,
    msgs: Vec<QueuedMessage>,
}

impl Queue {
    fn new(period_ms: u32) -> Self {
        Self {
            period_ms,
            next_send_ms: 0,
            msgs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ValueInfo {
    queue_index: usize,
    /// Position of the pending value for this id, if one is queued.
    value_pos: Option<usize>,
}

impl Default for ValueInfo {
    fn default() -> Self {
        Self {
            queue_index: 0,
            value_pos: None,
        }
    }
}

#[derive(Debug)]
pub struct NetworkOutgoingQueue {
    queues: Vec<Queue>,
    id_map: HashMap<TopicId, ValueInfo>,
    total_size: usize,
    last_send_ms: u64,
    last_period: Option<(u32, usize)>,
    local: bool,
}

impl NetworkOutgoingQueue {
    /// A local queue writes every value immediately.
    pub fn new(local: bool) -> Self {
        Self {
            queues: vec![Queue::new(DEFAULT_PERIOD_MS)],
            id_map: HashMap::new(),
            total_size: 0,
            last_send_ms: 0,
            last_period: None,
            local,
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of messages (of any kind) waiting to be written.
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.msgs.len()).sum()
    }

    /// Values currently queued for `id`, oldest first.
    pub fn pending_values(&self, id: TopicId) -> Vec<&Value> {
        self.queues
            .iter()
            .flat_map(|q| q.msgs.iter())
            .filter(|m| m.id == id)
            .filter_map(|m| match &m.msg {
                OutgoingMessage::Value(v) => Some(v),
                OutgoingMessage::Control(_) => None,
            })
            .collect()
    }

    /// Period of the bucket `id` currently lives in.
    pub fn period_of(&self, id: TopicId) -> u32 {
        let index = self.id_map.get(&id).map_or(0, |info| info.queue_index);
        self.queues[index].period_ms
    }

    /// Move `id` (and anything it has pending) to the bucket for `period_ms`.
    pub fn set_period(&mut self, id: TopicId, period_ms: u32) {
        let period_ms = period_ms.max(MIN_PERIOD_MS);
        let queue_index = match self.last_period {
            Some((period, index)) if period == period_ms => index,
            _ => {
                let index = match self.queues.iter().position(|q| q.period_ms == period_ms) {
                    Some(index) => index,
                    None => {
                        self.queues.push(Queue::new(period_ms));
                        self.queues.len() - 1
                    }
                };
                self.last_period = Some((period_ms, index));
                index
            }
        };

        let info = self.id_map.entry(id).or_default();
        let old_index = info.queue_index;
        if old_index == queue_index {
            return;
        }
        info.queue_index = queue_index;

        let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queues[old_index].msgs)
            .into_iter()
            .partition(|m| m.id == id);
        self.queues[old_index].msgs = kept;
        self.queues[queue_index].msgs.extend(moved);
        self.reindex(old_index);
        self.reindex(queue_index);
    }

    /// Stop coalescing into the value pending for `id`, so anything sent
    /// for it from now on queues behind what is already there.
    pub fn forget_value(&mut self, id: TopicId) {
        if let Some(info) = self.id_map.get_mut(&id) {
            info.value_pos = None;
        }
    }

    /// Queue a control message for `id`.
    pub fn send_message(&mut self, id: TopicId, msg: ServerMessage) {
        let index = self.id_map.entry(id).or_default().queue_index;
        let msg = OutgoingMessage::Control(msg);
        let size = msg.size();
        self.queues[index].msgs.push(QueuedMessage { id, msg, size });
        self.total_size += size;
    }

    pub fn send_value(
        &mut self,
        wire: &mut dyn WireConnection,
        id: TopicId,
        value: &Value,
        mut mode: ValueSendMode,
    ) {
        if self.local {
            mode = ValueSendMode::Imm;
        }
        if self.total_size >= OUTGOING_LIMIT && mode == ValueSendMode::All {
            mode = ValueSendMode::Normal;
        }

        match mode {
            ValueSendMode::Disabled => {}
            ValueSendMode::Imm => write_value(wire, id, value),
            ValueSendMode::Normal => {
                let info = *self.id_map.entry(id).or_default();
                if let Some(pos) = info.value_pos {
                    if let Some(queued) = self.queues[info.queue_index].msgs.get_mut(pos) {
                        if queued.id == id {
                            if let OutgoingMessage::Value(old) = &mut queued.msg {
                                // an older value never replaces a newer pending one
                                if value.time() >= old.time() {
                                    let size = value.approx_size();
                                    self.total_size = self.total_size - queued.size + size;
                                    *old = value.clone();
                                    queued.size = size;
                                }
                                return;
                            }
                        }
                    }
                }
                self.append_value(id, value);
            }
            ValueSendMode::All => self.append_value(id, value),
        }
    }

    fn append_value(&mut self, id: TopicId, value: &Value) {
        let info = self.id_map.entry(id).or_default();
        let queue = &mut self.queues[info.queue_index];
        info.value_pos = Some(queue.msgs.len());
        let size = value.approx_size();
        queue.msgs.push(QueuedMessage {
            id,
            msg: OutgoingMessage::Value(value.clone()),
            size,
        });
        self.total_size += size;
    }

    /// Write every bucket that is due (or all of them, if `flush`).
    pub fn send_outgoing(&mut self, wire: &mut dyn WireConnection, now_ms: u64, flush: bool) {
        if self.total_size == 0 {
            return;
        }
        if now_ms < self.last_send_ms + u64::from(MIN_PERIOD_MS) {
            return;
        }
        if !wire.ready() {
            return;
        }

        let mut due: Vec<usize> = self
            .queues
            .iter()
            .enumerate()
            .filter(|(_, q)| !q.msgs.is_empty() && (flush || now_ms >= q.next_send_ms))
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| self.queues[i].next_send_ms);

        for index in due {
            let Some((sent, unsent)) = write_queue(wire, &self.queues[index]) else {
                return;
            };
            let delta = sent.saturating_sub(unsent);

            let queue = &mut self.queues[index];
            for msg in queue.msgs.drain(..delta) {
                self.total_size -= msg.size;
            }
            for info in self.id_map.values_mut() {
                if info.queue_index != index {
                    continue;
                }
                info.value_pos = match info.value_pos {
                    Some(pos) if pos >= delta => Some(pos - delta),
                    _ => None,
                };
            }

            let period = u64::from(queue.period_ms.max(MIN_PERIOD_MS));
            queue.next_send_ms += period;
            if queue.next_send_ms <= now_ms {
                queue.next_send_ms = now_ms + period;
            }

            if unsent != 0 {
                debug!("wire backed up with {unsent} unsent messages");
                break;
            }
        }
        self.last_send_ms = now_ms;
    }

    fn reindex(&mut self, index: usize) {
        for info in self.id_map.values_mut() {
            if info.queue_index == index {
                info.value_pos = None;
            }
        }
        for (pos, msg) in self.queues[index].msgs.iter().enumerate() {
            if let OutgoingMessage::Value(_) = msg.msg {
                if let Some(info) = self.id_map.get_mut(&msg.id) {
                    info.value_pos = Some(pos);
                }
            }
        }
    }
}

/// Write one bucket in order. Returns how many messages were handed to the
/// wire and how many of those it reported as not actually sent, or `None`
/// if the wire failed outright.
fn write_queue(wire: &mut dyn WireConnection, queue: &Queue) -> Option<(usize, usize)> {
    let mut sent = 0;
    let mut unsent = 0;
    for queued in &queue.msgs {
        let result = match &queued.msg {
            OutgoingMessage::Control(msg) => match serde_json::to_string(msg) {
                Ok(text) => wire.write_text(text),
                Err(e) => {
                    warn!("failed to encode control message: {e}");
                    Ok(0)
                }
            },
            OutgoingMessage::Value(value) => match encode_frame(i64::from(queued.id), value) {
                Ok(frame) => wire.write_binary(frame),
                Err(e) => {
                    warn!("failed to encode value for topic {}: {e}", queued.id);
                    Ok(0)
                }
            },
        };
        match result {
            Ok(0) => sent += 1,
            Ok(n) => {
                sent += 1;
                unsent = n;
                break;
            }
            Err(e) => {
                debug!("write failed: {e}");
                return None;
            }
        }
    }
    if unsent == 0 {
        match wire.flush() {
            Ok(n) => unsent = n,
            Err(e) => {
                debug!("flush failed: {e}");
                return None;
            }
        }
    }
    Some((sent, unsent))
}

fn write_value(wire: &mut dyn WireConnection, id: TopicId, value: &Value) {
    match encode_frame(i64::from(id), value) {
        Ok(frame) => {
            if let Err(e) = wire.write_binary(frame).and_then(|_| wire.flush()) {
                debug!("immediate write failed: {e}");
            }
        }
        Err(e) => warn!("failed to encode value for topic {id}: {e}"),
    }
}

pub fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}
