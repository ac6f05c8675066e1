// A live WebSocket attached to one picture's editing room.

use std::sync::Mutex;
use std::time::Duration;

use picsync_common::types::{LeaveReason, Participant, PictureId, UserId};
use tokio::{sync::watch, time::Instant};
use uuid::Uuid;

use super::broadcast::OutboundQueue;
use crate::config::CollabConfig;

/// Why the relay closed (or observed the close of) a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent LEAVE.
    Left,
    /// The peer went away or the socket failed.
    Disconnected,
    ProtocolViolation,
    HeartbeatTimeout,
    SlowConsumer,
}

impl CloseReason {
    /// WebSocket close code sent to the client, if the relay initiates the close.
    pub const fn close_code(self) -> Option<u16> {
        match self {
            Self::Left => Some(1000),
            Self::Disconnected => None,
            Self::ProtocolViolation => Some(1008),
            Self::HeartbeatTimeout => Some(4000),
            Self::SlowConsumer => Some(1013),
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Left => "left room",
            Self::Disconnected => "disconnected",
            Self::ProtocolViolation => "too many protocol violations",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::SlowConsumer => "outbound queue saturated",
        }
    }

    /// Closes the relay initiates because the peer stopped keeping up. Their
    /// backlog is discarded and any in-flight write is abandoned.
    pub const fn abandons_peer(self) -> bool {
        matches!(self, Self::HeartbeatTimeout | Self::SlowConsumer)
    }

    pub const fn leave_reason(self) -> LeaveReason {
        match self {
            Self::Left => LeaveReason::Left,
            Self::Disconnected => LeaveReason::Disconnected,
            Self::ProtocolViolation => LeaveReason::ProtocolViolation,
            Self::HeartbeatTimeout => LeaveReason::HeartbeatTimeout,
            Self::SlowConsumer => LeaveReason::SlowConsumer,
        }
    }
}

/// Result of a heartbeat check against one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Recently heard from, or a probe is still within its window.
    Alive,
    /// No probe outstanding; time to send one.
    ProbeDue,
    /// A probe went unanswered for longer than the timeout.
    Expired,
}

#[derive(Debug)]
struct Heartbeat {
    last_seen: Instant,
    probe_sent_at: Option<Instant>,
}

#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    picture_id: PictureId,
    user_id: UserId,
    user_name: String,
    can_edit: bool,
    outbound: OutboundQueue,
    heartbeat: Mutex<Heartbeat>,
    close_reason: watch::Sender<Option<CloseReason>>,
}

impl Connection {
    pub fn new(
        picture_id: PictureId,
        user_id: UserId,
        user_name: String,
        can_edit: bool,
        config: &CollabConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            picture_id,
            user_id,
            user_name,
            can_edit,
            outbound: OutboundQueue::new(
                config.outbound_queue_capacity,
                config.slow_consumer_drop_limit,
            ),
            heartbeat: Mutex::new(Heartbeat { last_seen: Instant::now(), probe_sent_at: None }),
            close_reason: watch::Sender::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn picture_id(&self) -> PictureId {
        self.picture_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn can_edit(&self) -> bool {
        self.can_edit
    }

    pub fn participant(&self) -> Participant {
        Participant {
            connection_id: self.id,
            user_id: self.user_id,
            user_name: self.user_name.clone(),
            can_edit: self.can_edit,
        }
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Records inbound traffic; any frame counts as an answer to a probe.
    pub fn touch(&self) {
        let mut heartbeat = self.heartbeat.lock().expect("heartbeat lock poisoned");
        heartbeat.last_seen = Instant::now();
        heartbeat.probe_sent_at = None;
    }

    pub fn mark_probe_sent(&self, now: Instant) {
        self.heartbeat.lock().expect("heartbeat lock poisoned").probe_sent_at = Some(now);
    }

    pub fn last_seen(&self) -> Instant {
        self.heartbeat.lock().expect("heartbeat lock poisoned").last_seen
    }

    pub fn liveness(&self, now: Instant, timeout: Duration) -> Liveness {
        let heartbeat = self.heartbeat.lock().expect("heartbeat lock poisoned");
        match heartbeat.probe_sent_at {
            None => Liveness::ProbeDue,
            Some(sent_at) if now.saturating_duration_since(sent_at) > timeout => Liveness::Expired,
            Some(_) => Liveness::Alive,
        }
    }

    /// Closes the connection. The first reason wins; later calls are ignored.
    /// Returns whether this call set the reason.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.close_reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            self.outbound.close(reason.abandons_peer());
        }
        first
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.borrow()
    }

    /// Resolves once the connection is closed for a reason that abandons the
    /// peer. Socket writes race against this so a stalled peer cannot pin
    /// its task.
    pub async fn abandoned(&self) {
        let mut receiver = self.close_reason.subscribe();
        let _ = receiver
            .wait_for(|reason| reason.is_some_and(|reason| reason.abandons_peer()))
            .await;
    }
}
