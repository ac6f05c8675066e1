// WebSocket message types for the picture editing protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{LeaveReason, Participant, PictureId, ReleaseReason};

/// Client -> Server messages.
///
/// Every message names the picture it targets; the relay rejects messages
/// whose `pictureId` differs from the room the connection is attached to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Re-request the room snapshot. Connections join on upgrade.
    Join { picture_id: PictureId },

    /// Ask for the editor lock.
    EnterEdit { picture_id: PictureId },

    /// An edit operation; only the lock owner may send these.
    EditAction { picture_id: PictureId, payload: Value },

    /// Give the editor lock back.
    ExitEdit { picture_id: PictureId },

    /// Leave the room and close the connection.
    Leave { picture_id: PictureId },

    /// Request the current room snapshot.
    StateSync { picture_id: PictureId },
}

impl ClientMessage {
    pub fn picture_id(&self) -> PictureId {
        match self {
            Self::Join { picture_id }
            | Self::EnterEdit { picture_id }
            | Self::EditAction { picture_id, .. }
            | Self::ExitEdit { picture_id }
            | Self::Leave { picture_id }
            | Self::StateSync { picture_id } => *picture_id,
        }
    }

    /// Wire tag, used for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "JOIN",
            Self::EnterEdit { .. } => "ENTER_EDIT",
            Self::EditAction { .. } => "EDIT_ACTION",
            Self::ExitEdit { .. } => "EXIT_EDIT",
            Self::Leave { .. } => "LEAVE",
            Self::StateSync { .. } => "STATE_SYNC",
        }
    }
}

/// Server -> Client messages.
///
/// Room broadcasts carry the room's `seq`, which increases by one per
/// broadcast and is identical for every recipient of the same event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Snapshot of the room, sent to a joiner or on request. `seq` is the
    /// last broadcast the snapshot reflects.
    StateSync {
        picture_id: PictureId,
        seq: u64,
        connection_id: Uuid,
        participants: Vec<Participant>,
        editor: Option<Participant>,
    },

    /// Another participant joined.
    Join { picture_id: PictureId, seq: u64, participant: Participant, message: String },

    /// A participant left.
    Leave {
        picture_id: PictureId,
        seq: u64,
        participant: Participant,
        reason: LeaveReason,
        message: String,
    },

    /// The editor lock was taken. Sent to every participant, the new owner included.
    LockAcquired { picture_id: PictureId, seq: u64, owner: Participant, message: String },

    /// The editor lock was released. Sent to every remaining participant.
    LockReleased {
        picture_id: PictureId,
        seq: u64,
        previous_owner: Participant,
        reason: ReleaseReason,
        message: String,
    },

    /// An edit relayed to every participant except the editor.
    EditAction { picture_id: PictureId, seq: u64, editor: Participant, payload: Value },

    /// Sent to the editor instead of an echo; `seq` matches the relayed EDIT_ACTION.
    EditAck { picture_id: PictureId, seq: u64 },

    /// Error addressed to a single connection.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        picture_id: Option<PictureId>,
        code: CollabErrorCode,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<Participant>,
    },
}

impl ServerMessage {
    pub fn error(
        picture_id: Option<PictureId>,
        code: CollabErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            picture_id,
            code,
            message: message.into(),
            retryable: code.retryable(),
            owner: None,
        }
    }

    /// Room sequence number, absent on errors.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::StateSync { seq, .. }
            | Self::Join { seq, .. }
            | Self::Leave { seq, .. }
            | Self::LockAcquired { seq, .. }
            | Self::LockReleased { seq, .. }
            | Self::EditAction { seq, .. }
            | Self::EditAck { seq, .. } => Some(*seq),
            Self::Error { .. } => None,
        }
    }
}

/// Error codes carried in `ERROR` messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollabErrorCode {
    /// Malformed or misaddressed envelope.
    ProtocolViolation,
    /// Another participant holds the editor lock.
    RoomConflict,
    /// EDIT_ACTION while someone else holds the lock.
    NotOwner,
    /// EDIT_ACTION while nobody holds the lock.
    NoActiveEdit,
    /// The caller only has view access to the picture.
    EditForbidden,
}

impl CollabErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::RoomConflict => "ROOM_CONFLICT",
            Self::NotOwner => "NOT_OWNER",
            Self::NoActiveEdit => "NO_ACTIVE_EDIT",
            Self::EditForbidden => "EDIT_FORBIDDEN",
        }
    }

    /// A retry can succeed once room state changes.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::RoomConflict | Self::NotOwner | Self::NoActiveEdit)
    }
}
