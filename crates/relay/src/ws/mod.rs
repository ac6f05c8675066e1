// Real-time picture editing over WebSockets.
//
// One room actor per open picture owns the editor lock. Socket tasks only
// validate frames and forward them into the room's mailbox; the room fans
// results back out through per-connection outbound queues.

pub mod broadcast;
pub mod connection;
pub mod gateway;
pub mod heartbeat;
pub mod registry;
pub mod room;
pub mod router;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::{
    auth::{access::PictureAccessStore, jwt::JwtIdentityService},
    config::CollabConfig,
};
use registry::SessionRegistry;

#[derive(Clone)]
pub struct CollabState {
    pub identity: Arc<JwtIdentityService>,
    pub access: PictureAccessStore,
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<CollabConfig>,
}

impl CollabState {
    pub fn new(
        identity: Arc<JwtIdentityService>,
        access: PictureAccessStore,
        config: CollabConfig,
    ) -> Self {
        Self { identity, access, registry: SessionRegistry::new(), config: Arc::new(config) }
    }
}

pub fn router(state: CollabState) -> Router {
    Router::new()
        .route("/ws/picture/edit", get(gateway::picture_edit_upgrade))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Request, StatusCode},
    };
    use futures_util::{SinkExt, StreamExt};
    use picsync_common::{
        protocol::ws::{ClientMessage, CollabErrorCode, ServerMessage},
        types::{LeaveReason, ReleaseReason},
    };
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout, Instant};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{protocol::frame::coding::CloseCode, Message as WsFrame},
        MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::{connection::Liveness, heartbeat::HeartbeatMonitor, router, CollabState};
    use crate::auth::{
        access::{PictureAccessStore, SpaceRole, SpaceType},
        jwt::{JwtIdentityService, UserIdentity, UserRole},
    };
    use crate::config::CollabConfig;

    const TEST_SECRET: &str = "picsync_test_secret_that_is_definitely_long_enough";
    const PICTURE_ID: i64 = 42;
    const TEAM_SPACE_ID: i64 = 10;
    const VIEWER_ID: i64 = 3;

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn test_state(config: CollabConfig) -> CollabState {
        let identity =
            Arc::new(JwtIdentityService::new(TEST_SECRET).expect("identity service should build"));
        let access = PictureAccessStore::in_memory();
        access.insert_space_picture(PICTURE_ID, TEAM_SPACE_ID, SpaceType::Team).await;
        access.insert_space_picture(77, 20, SpaceType::Private).await;
        for user_id in [1, 2] {
            access.grant_space_role(TEAM_SPACE_ID, user_id, SpaceRole::Editor).await;
        }
        access.grant_space_role(TEAM_SPACE_ID, VIEWER_ID, SpaceRole::Viewer).await;

        CollabState::new(identity, access, config)
    }

    fn token_for(state: &CollabState, user_id: i64, user_name: &str) -> String {
        let identity =
            UserIdentity { user_id, user_name: user_name.to_owned(), role: UserRole::User };
        state.identity.issue_token(&identity).expect("token should be issued")
    }

    async fn spawn_server(state: CollabState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });

        format!("ws://{addr}/ws/picture/edit")
    }

    async fn connect(base_url: &str, token: &str) -> ClientSocket {
        let url = format!("{base_url}?pictureId={PICTURE_ID}&token={token}");
        let (socket, _) = connect_async(url).await.expect("websocket should connect");
        socket
    }

    async fn ws_send(socket: &mut ClientSocket, message: &ClientMessage) {
        let raw = serde_json::to_string(message).expect("client message should serialize");
        socket.send(WsFrame::Text(raw.into())).await.expect("ws message should send");
    }

    async fn ws_send_raw(socket: &mut ClientSocket, raw: &str) {
        socket.send(WsFrame::Text(raw.to_owned().into())).await.expect("ws message should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> ServerMessage {
        loop {
            let next = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame =
                next.expect("websocket should remain open").expect("websocket frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return serde_json::from_str::<ServerMessage>(&payload)
                        .expect("text frame should decode as server message");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(frame) => panic!("websocket closed unexpectedly: {frame:?}"),
                WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    /// Reads until the server pings, then answers with a Pong.
    async fn ws_answer_ping(socket: &mut ClientSocket) {
        loop {
            let next = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for ping");
            match next.expect("websocket should remain open").expect("frame should decode") {
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                    return;
                }
                WsFrame::Close(frame) => panic!("websocket closed unexpectedly: {frame:?}"),
                _ => {}
            }
        }
    }

    /// Reads until the server closes the socket and returns the close code.
    async fn ws_close_code(socket: &mut ClientSocket) -> Option<CloseCode> {
        loop {
            let next = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket close");
            match next {
                Some(Ok(WsFrame::Close(frame))) => return frame.map(|frame| frame.code),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    }

    async fn joined(base_url: &str, token: &str) -> (ClientSocket, Uuid) {
        let mut socket = connect(base_url, token).await;
        match ws_recv(&mut socket).await {
            ServerMessage::StateSync { connection_id, .. } => (socket, connection_id),
            other => panic!("expected state sync, got {other:?}"),
        }
    }

    async fn wait_for_room_count(state: &CollabState, expected: usize) {
        for _ in 0..100 {
            if state.registry.room_count() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("room count never reached {expected}");
    }

    async fn get_status(
        state: CollabState,
        uri: &str,
        bearer: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = router(state)
            .oneshot(request.body(Body::empty()).expect("request should build"))
            .await
            .expect("request should complete");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        (status, body)
    }

    #[tokio::test]
    async fn editor_lock_hand_off_between_two_participants() {
        let state = test_state(CollabConfig::default()).await;
        let base_url = spawn_server(state.clone()).await;
        let (mut alice, alice_id) = joined(&base_url, &token_for(&state, 1, "alice")).await;
        let (mut bob, bob_id) = joined(&base_url, &token_for(&state, 2, "bob")).await;

        match ws_recv(&mut alice).await {
            ServerMessage::Join { participant, .. } => {
                assert_eq!(participant.connection_id, bob_id);
                assert_eq!(participant.user_name, "bob");
            }
            other => panic!("expected join, got {other:?}"),
        }

        // Alice takes the lock; both observe it with the same seq.
        ws_send(&mut alice, &ClientMessage::EnterEdit { picture_id: PICTURE_ID }).await;
        let acquired_by_alice = ws_recv(&mut alice).await;
        let acquired_by_bob = ws_recv(&mut bob).await;
        assert_eq!(acquired_by_alice, acquired_by_bob);
        match &acquired_by_bob {
            ServerMessage::LockAcquired { owner, .. } => assert_eq!(owner.connection_id, alice_id),
            other => panic!("expected lock acquired, got {other:?}"),
        }

        // Bob is refused while alice edits.
        ws_send(&mut bob, &ClientMessage::EnterEdit { picture_id: PICTURE_ID }).await;
        match ws_recv(&mut bob).await {
            ServerMessage::Error { code, owner, retryable, .. } => {
                assert_eq!(code, CollabErrorCode::RoomConflict);
                assert!(retryable);
                assert_eq!(owner.map(|owner| owner.connection_id), Some(alice_id));
            }
            other => panic!("expected room conflict, got {other:?}"),
        }

        // Bob's edits never reach alice.
        let erase = ClientMessage::EditAction {
            picture_id: PICTURE_ID,
            payload: json!({ "op": "erase" }),
        };
        ws_send(&mut bob, &erase).await;
        match ws_recv(&mut bob).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, CollabErrorCode::NotOwner),
            other => panic!("expected not owner, got {other:?}"),
        }

        let draw = ClientMessage::EditAction {
            picture_id: PICTURE_ID,
            payload: json!({ "op": "draw" }),
        };
        ws_send(&mut alice, &draw).await;
        let relayed_seq = match ws_recv(&mut bob).await {
            ServerMessage::EditAction { seq, editor, payload, .. } => {
                assert_eq!(editor.connection_id, alice_id);
                assert_eq!(payload, json!({ "op": "draw" }));
                seq
            }
            other => panic!("expected edit action, got {other:?}"),
        };
        match ws_recv(&mut alice).await {
            ServerMessage::EditAck { seq, .. } => assert_eq!(seq, relayed_seq),
            other => panic!("expected edit ack, got {other:?}"),
        }

        // Alice drops; bob sees the lock released and then alice leaving.
        alice.close(None).await.expect("close should send");
        let released_seq = match ws_recv(&mut bob).await {
            ServerMessage::LockReleased { previous_owner, reason, seq, .. } => {
                assert_eq!(previous_owner.connection_id, alice_id);
                assert_eq!(reason, ReleaseReason::OwnerLeft);
                assert!(seq > relayed_seq);
                seq
            }
            other => panic!("expected lock released, got {other:?}"),
        };
        match ws_recv(&mut bob).await {
            ServerMessage::Leave { participant, reason, seq, .. } => {
                assert_eq!(participant.connection_id, alice_id);
                assert_eq!(reason, LeaveReason::Disconnected);
                assert_eq!(seq, released_seq + 1);
            }
            other => panic!("expected leave, got {other:?}"),
        }

        ws_send(&mut bob, &ClientMessage::EnterEdit { picture_id: PICTURE_ID }).await;
        match ws_recv(&mut bob).await {
            ServerMessage::LockAcquired { owner, .. } => assert_eq!(owner.connection_id, bob_id),
            other => panic!("expected lock acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_malformed_frames_disconnect_without_touching_the_lock() {
        let state = test_state(CollabConfig::default()).await;
        let base_url = spawn_server(state.clone()).await;
        let (mut alice, alice_id) = joined(&base_url, &token_for(&state, 1, "alice")).await;
        let (mut mallory, _) = joined(&base_url, &token_for(&state, 2, "mallory")).await;
        assert!(matches!(ws_recv(&mut alice).await, ServerMessage::Join { .. }));

        ws_send(&mut alice, &ClientMessage::EnterEdit { picture_id: PICTURE_ID }).await;
        assert!(matches!(ws_recv(&mut alice).await, ServerMessage::LockAcquired { .. }));
        assert!(matches!(ws_recv(&mut mallory).await, ServerMessage::LockAcquired { .. }));

        for attempt in 0..10 {
            let raw = if attempt % 2 == 0 { "{not json" } else { r#"{"type":"EXIT_EDIT"}"# };
            ws_send_raw(&mut mallory, raw).await;
        }
        for _ in 0..10 {
            match ws_recv(&mut mallory).await {
                ServerMessage::Error { code, .. } => {
                    assert_eq!(code, CollabErrorCode::ProtocolViolation);
                }
                other => panic!("expected protocol violation, got {other:?}"),
            }
        }
        assert_eq!(ws_close_code(&mut mallory).await, Some(CloseCode::Policy));

        match ws_recv(&mut alice).await {
            ServerMessage::Leave { reason, .. } => {
                assert_eq!(reason, LeaveReason::ProtocolViolation);
            }
            other => panic!("expected leave, got {other:?}"),
        }

        ws_send(&mut alice, &ClientMessage::StateSync { picture_id: PICTURE_ID }).await;
        match ws_recv(&mut alice).await {
            ServerMessage::StateSync { editor, participants, .. } => {
                assert_eq!(editor.map(|editor| editor.connection_id), Some(alice_id));
                assert_eq!(participants.len(), 1);
            }
            other => panic!("expected state sync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn viewers_can_watch_but_not_edit() {
        let state = test_state(CollabConfig::default()).await;
        let base_url = spawn_server(state.clone()).await;
        let (mut viewer, _) = joined(&base_url, &token_for(&state, VIEWER_ID, "vera")).await;

        ws_send(&mut viewer, &ClientMessage::EnterEdit { picture_id: PICTURE_ID }).await;
        match ws_recv(&mut viewer).await {
            ServerMessage::Error { code, retryable, .. } => {
                assert_eq!(code, CollabErrorCode::EditForbidden);
                assert!(!retryable);
            }
            other => panic!("expected edit forbidden, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_message_closes_normally_and_drops_the_room() {
        let state = test_state(CollabConfig::default()).await;
        let base_url = spawn_server(state.clone()).await;
        let (mut alice, _) = joined(&base_url, &token_for(&state, 1, "alice")).await;
        assert_eq!(state.registry.room_count(), 1);

        ws_send(&mut alice, &ClientMessage::Leave { picture_id: PICTURE_ID }).await;
        assert_eq!(ws_close_code(&mut alice).await, Some(CloseCode::Normal));

        wait_for_room_count(&state, 0).await;
    }

    #[tokio::test]
    async fn rooms_are_isolated_per_picture() {
        let state = test_state(CollabConfig::default()).await;
        state.access.insert_space_picture(43, TEAM_SPACE_ID, SpaceType::Team).await;
        let base_url = spawn_server(state.clone()).await;
        let (mut alice, _) = joined(&base_url, &token_for(&state, 1, "alice")).await;

        let url = format!("{base_url}?pictureId=43&token={}", token_for(&state, 2, "bob"));
        let (mut bob, _) = connect_async(url).await.expect("websocket should connect");
        match ws_recv(&mut bob).await {
            ServerMessage::StateSync { picture_id, participants, .. } => {
                assert_eq!(picture_id, 43);
                assert_eq!(participants.len(), 1);
            }
            other => panic!("expected state sync, got {other:?}"),
        }
        assert_eq!(state.registry.room_count(), 2);

        ws_send(&mut bob, &ClientMessage::EnterEdit { picture_id: 43 }).await;
        assert!(matches!(ws_recv(&mut bob).await, ServerMessage::LockAcquired { .. }));

        // Alice's room saw nothing of bob.
        ws_send(&mut alice, &ClientMessage::EnterEdit { picture_id: PICTURE_ID }).await;
        match ws_recv(&mut alice).await {
            ServerMessage::LockAcquired { picture_id, seq, .. } => {
                assert_eq!(picture_id, PICTURE_ID);
                assert_eq!(seq, 2);
            }
            other => panic!("expected lock acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upgrade_rejects_bad_requests_before_touching_rooms() {
        let state = test_state(CollabConfig::default()).await;
        let token = token_for(&state, 1, "alice");
        let outsider = token_for(&state, 99, "eve");

        let (status, body) = get_status(state.clone(), "/ws/picture/edit", Some(&token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

        let (status, body) =
            get_status(state.clone(), "/ws/picture/edit?pictureId=abc", Some(&token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

        let (status, body) = get_status(state.clone(), "/ws/picture/edit?pictureId=42", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");

        let (status, _) =
            get_status(state.clone(), "/ws/picture/edit?pictureId=42&token=garbage", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            get_status(state.clone(), "/ws/picture/edit?pictureId=404", Some(&token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, body) =
            get_status(state.clone(), "/ws/picture/edit?pictureId=42", Some(&outsider)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "AUTH_FORBIDDEN");

        let (status, _) =
            get_status(state.clone(), "/ws/picture/edit?pictureId=77", Some(&token)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        assert_eq!(state.registry.room_count(), 0);
        assert_eq!(state.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn admitted_request_without_upgrade_headers_is_not_a_websocket() {
        let state = test_state(CollabConfig::default()).await;
        let token = token_for(&state, 1, "alice");

        let (status, _) =
            get_status(state.clone(), "/ws/picture/edit?pictureId=42", Some(&token)).await;
        assert!(status.is_client_error());
        assert_eq!(state.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn unanswered_heartbeat_closes_with_timeout_code() {
        let config = CollabConfig {
            heartbeat_interval: Duration::from_millis(300),
            heartbeat_timeout: Duration::from_millis(200),
            ..CollabConfig::default()
        };
        let state = test_state(config.clone()).await;
        let base_url = spawn_server(state.clone()).await;
        let (mut watcher, _) = joined(&base_url, &token_for(&state, 1, "alice")).await;
        let (mut silent, silent_id) = joined(&base_url, &token_for(&state, 2, "bob")).await;
        assert!(matches!(ws_recv(&mut watcher).await, ServerMessage::Join { .. }));

        let monitor = HeartbeatMonitor::new(Arc::clone(&state.registry), &config);
        let start = Instant::now();
        assert_eq!(monitor.sweep(start).probed, 2);

        // Only the watcher answers its probe.
        ws_answer_ping(&mut watcher).await;
        let watcher_connection = state
            .registry
            .snapshot_connections()
            .into_iter()
            .find(|connection| connection.id() != silent_id)
            .expect("watcher should be registered");
        for _ in 0..100 {
            if watcher_connection.liveness(start, config.heartbeat_timeout) == Liveness::ProbeDue {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            watcher_connection.liveness(start, config.heartbeat_timeout),
            Liveness::ProbeDue,
            "pong should clear the outstanding probe"
        );

        let report = monitor.sweep(start + Duration::from_millis(300));
        assert_eq!(report.expired, 1);

        match ws_recv(&mut watcher).await {
            ServerMessage::Leave { participant, reason, .. } => {
                assert_eq!(participant.connection_id, silent_id);
                assert_eq!(reason, LeaveReason::HeartbeatTimeout);
            }
            other => panic!("expected leave, got {other:?}"),
        }
        assert_eq!(ws_close_code(&mut silent).await, Some(CloseCode::Library(4000)));
    }

    #[tokio::test]
    async fn stalled_reader_is_cut_off_as_slow_consumer() {
        let config = CollabConfig {
            outbound_queue_capacity: 64,
            slow_consumer_drop_limit: 64,
            ..CollabConfig::default()
        };
        let state = test_state(config).await;
        let base_url = spawn_server(state.clone()).await;
        let (mut alice, _) = joined(&base_url, &token_for(&state, 1, "alice")).await;
        // Bob never reads past his STATE_SYNC.
        let (_bob, bob_id) = joined(&base_url, &token_for(&state, 2, "bob")).await;
        assert!(matches!(ws_recv(&mut alice).await, ServerMessage::Join { .. }));

        ws_send(&mut alice, &ClientMessage::EnterEdit { picture_id: PICTURE_ID }).await;
        assert!(matches!(ws_recv(&mut alice).await, ServerMessage::LockAcquired { .. }));

        let (mut alice_tx, mut alice_rx) = alice.split();
        let departures = tokio::spawn(async move {
            loop {
                let frame = alice_rx
                    .next()
                    .await
                    .expect("alice should stay connected")
                    .expect("frame should decode");
                let WsFrame::Text(payload) = frame else {
                    continue;
                };
                let message: ServerMessage =
                    serde_json::from_str(&payload).expect("text frame should decode");
                if let ServerMessage::Leave { participant, reason, .. } = message {
                    return (participant.connection_id, reason);
                }
            }
        });

        let stroke = ClientMessage::EditAction {
            picture_id: PICTURE_ID,
            payload: json!({ "op": "draw", "path": "x".repeat(14 * 1024) }),
        };
        let raw = serde_json::to_string(&stroke).expect("edit should serialize");
        let mut sent = 0;
        while !departures.is_finished() && sent < 5_000 {
            alice_tx.send(WsFrame::Text(raw.clone().into())).await.expect("edit should send");
            sent += 1;
        }

        let (departed, reason) = timeout(Duration::from_secs(5), departures)
            .await
            .expect("bob should be cut off")
            .expect("reader task should not panic");
        assert_eq!(departed, bob_id);
        assert_eq!(reason, LeaveReason::SlowConsumer);

        // Bob's socket task gives up its stalled write and unregisters.
        for _ in 0..200 {
            if state.registry.connection_count() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.registry.connection_count(), 1);
        assert_eq!(state.registry.room_count(), 1);
    }
}
