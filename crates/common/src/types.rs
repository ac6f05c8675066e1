// Core domain types shared by the relay and its clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric picture identifier as issued by the picture backend.
pub type PictureId = i64;

/// Numeric user identifier as issued by the identity provider.
pub type UserId = i64;

/// A member of an editing room, as reported to the other members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: Uuid,
    pub user_id: UserId,
    pub user_name: String,
    /// Whether this participant may take the editor lock.
    pub can_edit: bool,
}

/// Why a participant left a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaveReason {
    /// The client sent LEAVE.
    Left,
    /// The socket closed or errored.
    Disconnected,
    HeartbeatTimeout,
    ProtocolViolation,
    /// The outbound queue stayed saturated and the relay dropped the client.
    SlowConsumer,
}

impl LeaveReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Disconnected => "disconnected",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::SlowConsumer => "slow_consumer",
        }
    }
}

/// Why the editor lock was released.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseReason {
    /// The owner sent EXIT_EDIT.
    Exited,
    /// The owner left the room while holding the lock.
    OwnerLeft,
}
