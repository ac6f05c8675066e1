// Upgrade admission and the per-socket task.
//
// Every rejection happens before the upgrade, so a refused caller never
// creates a connection or touches a room. Socket writes are bounded: a peer
// that stops draining is cut loose instead of pinning its task.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
};
use picsync_common::{protocol::ws::ClientMessage, types::PictureId};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{
    broadcast::{self, OutboundFrame},
    connection::{CloseReason, Connection},
    room::{RoomCommand, RoomHandle},
    router::{MessageRouter, RouteOutcome},
    CollabState,
};
use crate::{
    auth::{
        access::{AccessError, PictureAccess},
        jwt::{extract_bearer_token, UserIdentity},
    },
    error::{request_id_from_headers_or_generate, with_request_id_scope, AdmissionError},
    metrics,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditQuery {
    picture_id: Option<String>,
    token: Option<String>,
}

/// Caller admitted to a picture's room.
#[derive(Debug, Clone)]
pub struct Admission {
    pub picture_id: PictureId,
    pub identity: UserIdentity,
    pub access: PictureAccess,
}

pub async fn picture_edit_upgrade(
    State(state): State<CollabState>,
    Query(query): Query<EditQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let admission = match admit(&state, &query, &headers).await {
        Ok(admission) => admission,
        Err(error) => return error.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes).max_message_size(max_frame_bytes).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, admission, socket)).await;
        },
    )
}

/// Resolves who is calling and whether they may open the picture.
pub async fn admit(
    state: &CollabState,
    query: &EditQuery,
    headers: &HeaderMap,
) -> Result<Admission, AdmissionError> {
    let picture_id = query
        .picture_id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<PictureId>().ok())
        .filter(|picture_id| *picture_id > 0)
        .ok_or(AdmissionError::InvalidPictureId)?;

    let token = query
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(extract_bearer_token)
        })
        .ok_or(AdmissionError::MissingToken)?;

    let identity = state.identity.validate_token(token).map_err(|error| {
        debug!(?error, "rejected access token");
        AdmissionError::InvalidToken
    })?;

    let access = match state.access.access_for(picture_id, &identity).await {
        Ok(access) => access,
        Err(AccessError::PictureNotFound(_)) => {
            return Err(AdmissionError::PictureNotFound(picture_id));
        }
        Err(error) => {
            error!(
                ?error,
                picture_id,
                user_id = identity.user_id,
                "failed to resolve picture access"
            );
            return Err(AdmissionError::AccessUnavailable);
        }
    };

    if !access.can_join() {
        return Err(AdmissionError::Forbidden);
    }

    Ok(Admission { picture_id, identity, access })
}

async fn handle_socket(state: CollabState, admission: Admission, mut socket: WebSocket) {
    let connection = Arc::new(Connection::new(
        admission.picture_id,
        admission.identity.user_id,
        admission.identity.user_name,
        admission.access.can_edit(),
        &state.config,
    ));
    let room = state.registry.join(Arc::clone(&connection));
    let mut router = MessageRouter::new(connection.id(), connection.picture_id(), &state.config);
    let write_timeout = state.config.heartbeat_timeout;
    metrics::add_connections_active(1);
    info!(
        connection_id = %connection.id(),
        picture_id = connection.picture_id(),
        user_id = connection.user_id(),
        can_edit = connection.can_edit(),
        room_id = %room.room_id(),
        "connection joined room"
    );

    loop {
        tokio::select! {
            maybe_outbound = connection.outbound().next() => {
                let Some(frame) = maybe_outbound else {
                    break;
                };
                let message = match frame {
                    OutboundFrame::Text(text) => Message::Text(text),
                    OutboundFrame::Ping => Message::Ping(vec![].into()),
                };
                if !send_bounded(&mut socket, &connection, message, write_timeout).await {
                    connection.close(CloseReason::Disconnected);
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    connection.close(CloseReason::Disconnected);
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        connection.touch();
                        let outcome = router.route_text(raw_message.as_str());
                        handle_route_outcome(&connection, &room, outcome);
                    }
                    Ok(Message::Binary(_)) => {
                        connection.touch();
                        let outcome = router.route_binary();
                        handle_route_outcome(&connection, &room, outcome);
                    }
                    Ok(Message::Ping(payload)) => {
                        connection.touch();
                        let pong = Message::Pong(payload);
                        if !send_bounded(&mut socket, &connection, pong, write_timeout).await {
                            connection.close(CloseReason::Disconnected);
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => connection.touch(),
                    Ok(Message::Close(_)) | Err(_) => {
                        connection.close(CloseReason::Disconnected);
                        break;
                    }
                }
            }
        }
    }

    let reason = connection.close_reason().unwrap_or(CloseReason::Disconnected);
    leave(&connection, &room, reason);
    state.registry.unregister_connection(connection.id());
    metrics::add_connections_active(-1);

    if let Some(code) = reason.close_code() {
        let close = Message::Close(Some(CloseFrame { code, reason: reason.description().into() }));
        if tokio::time::timeout(write_timeout, socket.send(close)).await.is_err() {
            debug!(connection_id = %connection.id(), "close frame not delivered in time");
        }
    }

    info!(
        connection_id = %connection.id(),
        picture_id = connection.picture_id(),
        reason = reason.description(),
        "connection closed"
    );
}

/// Writes one frame. Gives up when the connection is abandoned mid-write or
/// the peer does not accept the frame within `limit`.
async fn send_bounded(
    socket: &mut WebSocket,
    connection: &Connection,
    message: Message,
    limit: Duration,
) -> bool {
    tokio::select! {
        sent = tokio::time::timeout(limit, socket.send(message)) => match sent {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                debug!(connection_id = %connection.id(), ?error, "websocket send failed");
                false
            }
            Err(_) => {
                warn!(connection_id = %connection.id(), "websocket send stalled, disconnecting");
                false
            }
        },
        () = connection.abandoned() => false,
    }
}

/// Closes the connection and routes its LEAVE, unless it was already closed.
fn close_and_leave(connection: &Connection, room: &RoomHandle, reason: CloseReason) {
    if connection.close(reason) {
        leave(connection, room, reason);
    }
}

fn leave(connection: &Connection, room: &RoomHandle, reason: CloseReason) {
    room.send(RoomCommand::Leave { connection_id: connection.id(), reason: reason.leave_reason() });
}

fn handle_route_outcome(connection: &Connection, room: &RoomHandle, outcome: RouteOutcome) {
    match outcome {
        RouteOutcome::Deliver(ClientMessage::Leave { .. }) => {
            metrics::record_ws_message("LEAVE", false);
            close_and_leave(connection, room, CloseReason::Left);
        }
        RouteOutcome::Deliver(message) => {
            metrics::record_ws_message(message.kind(), false);
            room.send(RoomCommand::Inbound { connection_id: connection.id(), message });
        }
        RouteOutcome::Reject { error, disconnect } => {
            metrics::record_ws_message("invalid", true);
            if broadcast::send_to(connection, &error) {
                leave(connection, room, CloseReason::SlowConsumer);
            }
            if disconnect {
                warn!(
                    connection_id = %connection.id(),
                    picture_id = connection.picture_id(),
                    "protocol violation limit reached, disconnecting"
                );
                close_and_leave(connection, room, CloseReason::ProtocolViolation);
            }
        }
    }
}
