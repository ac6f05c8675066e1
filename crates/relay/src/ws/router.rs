// Inbound frame validation for one connection.

use picsync_common::{
    protocol::ws::{ClientMessage, CollabErrorCode, ServerMessage},
    types::PictureId,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::{config::CollabConfig, metrics};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("binary frames are not supported")]
    BinaryFrame,
    #[error("invalid message envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("ERROR messages may only be sent by the server")]
    ServerOnlyType,
    #[error("message targets picture {actual} but this connection edits picture {expected}")]
    PictureMismatch { expected: PictureId, actual: PictureId },
    #[error("edit payload must be an object with a non-empty string `op`")]
    InvalidEditPayload,
    #[error("edit payload is {size} bytes, limit is {limit}")]
    EditPayloadTooLarge { size: usize, limit: usize },
}

#[derive(Debug)]
pub enum RouteOutcome {
    /// A valid message for the connection's room.
    Deliver(ClientMessage),
    /// The frame was rejected; `error` goes back to the sender only.
    Reject { error: ServerMessage, disconnect: bool },
}

/// Decodes and validates inbound frames, keeping a cumulative violation count.
#[derive(Debug)]
pub struct MessageRouter {
    connection_id: Uuid,
    picture_id: PictureId,
    max_edit_payload_bytes: usize,
    max_violations: u32,
    violations: u32,
}

impl MessageRouter {
    pub fn new(connection_id: Uuid, picture_id: PictureId, config: &CollabConfig) -> Self {
        Self {
            connection_id,
            picture_id,
            max_edit_payload_bytes: config.max_edit_payload_bytes,
            max_violations: config.max_protocol_violations,
            violations: 0,
        }
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn route_text(&mut self, raw: &str) -> RouteOutcome {
        match self.validate(raw) {
            Ok(message) => RouteOutcome::Deliver(message),
            Err(error) => self.reject(error),
        }
    }

    pub fn route_binary(&mut self) -> RouteOutcome {
        self.reject(RouteError::BinaryFrame)
    }

    fn validate(&self, raw: &str) -> Result<ClientMessage, RouteError> {
        let envelope: Value = serde_json::from_str(raw)?;
        if envelope.get("type").and_then(Value::as_str) == Some("ERROR") {
            return Err(RouteError::ServerOnlyType);
        }

        let message = ClientMessage::deserialize(envelope)?;
        let actual = message.picture_id();
        if actual != self.picture_id {
            return Err(RouteError::PictureMismatch { expected: self.picture_id, actual });
        }

        if let ClientMessage::EditAction { payload, .. } = &message {
            self.validate_edit_payload(payload)?;
        }

        Ok(message)
    }

    fn validate_edit_payload(&self, payload: &Value) -> Result<(), RouteError> {
        let has_op = payload
            .as_object()
            .and_then(|object| object.get("op"))
            .and_then(Value::as_str)
            .is_some_and(|op| !op.trim().is_empty());
        if !has_op {
            return Err(RouteError::InvalidEditPayload);
        }

        let size = serde_json::to_vec(payload)?.len();
        if size > self.max_edit_payload_bytes {
            return Err(RouteError::EditPayloadTooLarge {
                size,
                limit: self.max_edit_payload_bytes,
            });
        }

        Ok(())
    }

    fn reject(&mut self, error: RouteError) -> RouteOutcome {
        self.violations = self.violations.saturating_add(1);
        let disconnect = self.violations >= self.max_violations;
        metrics::increment_protocol_violations();
        warn!(
            connection_id = %self.connection_id,
            picture_id = self.picture_id,
            violations = self.violations,
            disconnect,
            error = %error,
            "rejected inbound frame"
        );

        RouteOutcome::Reject {
            error: ServerMessage::error(
                Some(self.picture_id),
                CollabErrorCode::ProtocolViolation,
                error.to_string(),
            ),
            disconnect,
        }
    }
}
