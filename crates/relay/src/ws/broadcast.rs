// Outbound delivery: bounded per-connection queues and room fan-out.
//
// Room actors only ever push into queues; a connection's socket task drains
// its own queue. Pushing never awaits, so a slow socket cannot stall a room.
// Whoever pushes the frame that saturates a queue owns the resulting LEAVE:
// the helpers below report the connections they cut off.

use std::{collections::VecDeque, sync::Arc, sync::Mutex};

use axum::extract::ws::Utf8Bytes;
use picsync_common::protocol::ws::ServerMessage;
use tokio::sync::Notify;
use tracing::{error, warn};
use uuid::Uuid;

use super::connection::{CloseReason, Connection};
use crate::metrics;

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Pre-encoded JSON text frame, shared between recipients.
    Text(Utf8Bytes),
    /// Liveness probe.
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; its oldest frame was evicted.
    DroppedOldest,
    /// Evictions kept happening without the writer draining anything.
    Saturated,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<OutboundFrame>,
    consecutive_drops: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    drop_limit: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize, drop_limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            drop_limit,
        }
    }

    /// Enqueues a frame, evicting the oldest one when full.
    pub fn push(&self, frame: OutboundFrame) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock().expect("outbound queue lock poisoned");
            if state.closed {
                return PushOutcome::Closed;
            }

            let outcome = if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.consecutive_drops += 1;
                if state.consecutive_drops >= self.drop_limit {
                    PushOutcome::Saturated
                } else {
                    PushOutcome::DroppedOldest
                }
            } else {
                PushOutcome::Queued
            };
            state.frames.push_back(frame);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    pub fn pop(&self) -> Option<OutboundFrame> {
        let mut state = self.state.lock().expect("outbound queue lock poisoned");
        let frame = state.frames.pop_front();
        if frame.is_some() {
            state.consecutive_drops = 0;
        }
        frame
    }

    /// Waits for the next frame. Returns `None` once the queue is closed and
    /// every remaining frame has been handed out.
    pub async fn next(&self) -> Option<OutboundFrame> {
        loop {
            {
                let mut state = self.state.lock().expect("outbound queue lock poisoned");
                if let Some(frame) = state.frames.pop_front() {
                    state.consecutive_drops = 0;
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting frames. With `discard`, pending frames are dropped too.
    pub fn close(&self, discard: bool) {
        {
            let mut state = self.state.lock().expect("outbound queue lock poisoned");
            state.closed = true;
            if discard {
                state.frames.clear();
            }
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("outbound queue lock poisoned").frames.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("outbound queue lock poisoned").closed
    }
}

/// Serializes a message once so it can be shared by every recipient.
pub fn encode(message: &ServerMessage) -> Option<Utf8Bytes> {
    match serde_json::to_string(message) {
        Ok(encoded) => Some(Utf8Bytes::from(encoded)),
        Err(error) => {
            error!(?error, "failed to encode outbound message");
            None
        }
    }
}

/// Queues a frame for one connection, enforcing the slow-consumer policy.
///
/// Returns true when this push cut the connection off as a slow consumer.
/// The caller must then route a LEAVE(SLOW_CONSUMER) into the room.
#[must_use]
pub fn enqueue(connection: &Connection, frame: OutboundFrame) -> bool {
    match connection.outbound().push(frame) {
        PushOutcome::Queued | PushOutcome::Closed => false,
        PushOutcome::DroppedOldest => {
            metrics::increment_outbound_frames_dropped();
            false
        }
        PushOutcome::Saturated => {
            metrics::increment_outbound_frames_dropped();
            let cut_off = connection.close(CloseReason::SlowConsumer);
            if cut_off {
                warn!(
                    connection_id = %connection.id(),
                    picture_id = connection.picture_id(),
                    user_id = connection.user_id(),
                    "outbound queue saturated, disconnecting slow consumer"
                );
            }
            cut_off
        }
    }
}

#[must_use]
pub fn send_to(connection: &Connection, message: &ServerMessage) -> bool {
    encode(message).is_some_and(|encoded| enqueue(connection, OutboundFrame::Text(encoded)))
}

/// Delivers one encoding of `message` to every recipient and returns the ids
/// of the connections cut off along the way.
#[must_use]
pub fn fan_out<'a, I>(recipients: I, message: &ServerMessage) -> Vec<Uuid>
where
    I: IntoIterator<Item = &'a Arc<Connection>>,
{
    let Some(encoded) = encode(message) else {
        return Vec::new();
    };

    recipients
        .into_iter()
        .filter(|connection| enqueue(connection, OutboundFrame::Text(encoded.clone())))
        .map(|connection| connection.id())
        .collect()
}
