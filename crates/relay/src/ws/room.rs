// One editing room per picture.
//
// `RoomState` is the editor-lock state machine. It is pure: every event
// returns the messages to deliver, and only the room's actor task ever
// applies events, so transitions for one room are strictly sequential.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use picsync_common::{
    protocol::ws::{ClientMessage, CollabErrorCode, ServerMessage},
    types::{LeaveReason, Participant, PictureId, ReleaseReason},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{broadcast, connection::Connection, registry::SessionRegistry};
use crate::metrics;

/// Events a room understands, after inbound frames have been validated.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Join(Participant),
    EnterEdit(Uuid),
    EditAction(Uuid, Value),
    ExitEdit(Uuid),
    Sync(Uuid),
    Leave(Uuid, LeaveReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    Only(Uuid),
    All,
    AllExcept(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub recipients: Recipients,
    pub message: ServerMessage,
}

impl Dispatch {
    fn new(recipients: Recipients, message: ServerMessage) -> Self {
        Self { recipients, message }
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    picture_id: PictureId,
    /// Join order.
    participants: Vec<Participant>,
    editor: Option<Uuid>,
    seq: u64,
}

impl RoomState {
    pub fn new(picture_id: PictureId) -> Self {
        Self { picture_id, participants: Vec::new(), editor: None, seq: 0 }
    }

    pub fn picture_id(&self) -> PictureId {
        self.picture_id
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn editor(&self) -> Option<&Participant> {
        self.editor.and_then(|editor| self.participant(editor))
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn participant(&self, connection_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|participant| participant.connection_id == connection_id)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn snapshot_for(&self, connection_id: Uuid) -> ServerMessage {
        ServerMessage::StateSync {
            picture_id: self.picture_id,
            seq: self.seq,
            connection_id,
            participants: self.participants.clone(),
            editor: self.editor().cloned(),
        }
    }

    fn snapshot_dispatch(&self, connection_id: Uuid) -> Dispatch {
        Dispatch::new(Recipients::Only(connection_id), self.snapshot_for(connection_id))
    }

    fn error_to(&self, connection_id: Uuid, code: CollabErrorCode, message: &str) -> Dispatch {
        Dispatch::new(
            Recipients::Only(connection_id),
            ServerMessage::error(Some(self.picture_id), code, message),
        )
    }

    pub fn apply(&mut self, event: RoomEvent) -> Vec<Dispatch> {
        match event {
            RoomEvent::Join(participant) => self.join(participant),
            RoomEvent::EnterEdit(connection_id) => self.enter_edit(connection_id),
            RoomEvent::EditAction(connection_id, payload) => {
                self.edit_action(connection_id, payload)
            }
            RoomEvent::ExitEdit(connection_id) => self.exit_edit(connection_id),
            RoomEvent::Sync(connection_id) => {
                if self.participant(connection_id).is_none() {
                    return Vec::new();
                }
                vec![self.snapshot_dispatch(connection_id)]
            }
            RoomEvent::Leave(connection_id, reason) => self.leave(connection_id, reason),
        }
    }

    fn join(&mut self, participant: Participant) -> Vec<Dispatch> {
        let connection_id = participant.connection_id;
        if self.participant(connection_id).is_some() {
            return self.apply(RoomEvent::Sync(connection_id));
        }

        self.participants.push(participant.clone());
        let seq = self.next_seq();
        let message = format!("{} joined", participant.user_name);

        vec![
            Dispatch::new(
                Recipients::AllExcept(connection_id),
                ServerMessage::Join { picture_id: self.picture_id, seq, participant, message },
            ),
            self.snapshot_dispatch(connection_id),
        ]
    }

    fn enter_edit(&mut self, connection_id: Uuid) -> Vec<Dispatch> {
        let Some(requester) = self.participant(connection_id).cloned() else {
            return Vec::new();
        };

        if !requester.can_edit {
            return vec![self.error_to(
                connection_id,
                CollabErrorCode::EditForbidden,
                "you only have view access to this picture",
            )];
        }

        match self.editor {
            None => {
                self.editor = Some(connection_id);
                let seq = self.next_seq();
                let message = format!("{} started editing", requester.user_name);
                vec![Dispatch::new(
                    Recipients::All,
                    ServerMessage::LockAcquired {
                        picture_id: self.picture_id,
                        seq,
                        owner: requester,
                        message,
                    },
                )]
            }
            Some(owner) if owner == connection_id => vec![self.snapshot_dispatch(connection_id)],
            Some(_) => {
                let owner = self.editor().cloned();
                let mut dispatch = self.error_to(
                    connection_id,
                    CollabErrorCode::RoomConflict,
                    "another participant is editing this picture",
                );
                if let ServerMessage::Error { owner: slot, .. } = &mut dispatch.message {
                    *slot = owner;
                }
                vec![dispatch]
            }
        }
    }

    fn edit_action(&mut self, connection_id: Uuid, payload: Value) -> Vec<Dispatch> {
        if self.participant(connection_id).is_none() {
            return Vec::new();
        }

        match self.editor {
            Some(owner) if owner == connection_id => {
                let editor = self.editor().cloned();
                let Some(editor) = editor else {
                    return Vec::new();
                };
                let seq = self.next_seq();
                vec![
                    Dispatch::new(
                        Recipients::AllExcept(connection_id),
                        ServerMessage::EditAction {
                            picture_id: self.picture_id,
                            seq,
                            editor,
                            payload,
                        },
                    ),
                    Dispatch::new(
                        Recipients::Only(connection_id),
                        ServerMessage::EditAck { picture_id: self.picture_id, seq },
                    ),
                ]
            }
            Some(_) => {
                let owner = self.editor().cloned();
                let mut dispatch = self.error_to(
                    connection_id,
                    CollabErrorCode::NotOwner,
                    "only the current editor may send edit actions",
                );
                if let ServerMessage::Error { owner: slot, .. } = &mut dispatch.message {
                    *slot = owner;
                }
                vec![dispatch]
            }
            None => vec![self.error_to(
                connection_id,
                CollabErrorCode::NoActiveEdit,
                "enter edit mode before sending edit actions",
            )],
        }
    }

    fn exit_edit(&mut self, connection_id: Uuid) -> Vec<Dispatch> {
        if self.editor != Some(connection_id) {
            return Vec::new();
        }
        self.release_lock(connection_id, ReleaseReason::Exited).into_iter().collect()
    }

    fn release_lock(&mut self, owner: Uuid, reason: ReleaseReason) -> Option<Dispatch> {
        let previous_owner = self.participant(owner).cloned()?;
        self.editor = None;
        let seq = self.next_seq();
        let message = format!("{} stopped editing", previous_owner.user_name);

        Some(Dispatch::new(
            Recipients::All,
            ServerMessage::LockReleased {
                picture_id: self.picture_id,
                seq,
                previous_owner,
                reason,
                message,
            },
        ))
    }

    fn leave(&mut self, connection_id: Uuid, reason: LeaveReason) -> Vec<Dispatch> {
        let Some(index) = self
            .participants
            .iter()
            .position(|participant| participant.connection_id == connection_id)
        else {
            return Vec::new();
        };

        let mut dispatches = Vec::new();
        if self.editor == Some(connection_id) {
            // Release while the owner is still listed so the event names them.
            dispatches.extend(self.release_lock(connection_id, ReleaseReason::OwnerLeft));
        }

        let participant = self.participants.remove(index);
        if self.participants.is_empty() {
            return Vec::new();
        }

        let seq = self.next_seq();
        let message = format!("{} left", participant.user_name);
        dispatches.push(Dispatch::new(
            Recipients::All,
            ServerMessage::Leave { picture_id: self.picture_id, seq, participant, reason, message },
        ));
        dispatches
    }
}

/// Mailbox entries for a room actor.
#[derive(Debug)]
pub enum RoomCommand {
    Join(Arc<Connection>),
    Inbound { connection_id: Uuid, message: ClientMessage },
    Leave { connection_id: Uuid, reason: LeaveReason },
}

/// Sending half of a room's mailbox.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: Uuid,
    picture_id: PictureId,
    sender: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn picture_id(&self) -> PictureId {
        self.picture_id
    }

    /// Returns false when the room has already shut down.
    pub fn send(&self, command: RoomCommand) -> bool {
        self.sender.send(command).is_ok()
    }
}

pub struct RoomActor {
    room_id: Uuid,
    state: RoomState,
    connections: HashMap<Uuid, Arc<Connection>>,
    registry: Arc<SessionRegistry>,
}

impl RoomActor {
    /// Spawns the actor task and returns the handle feeding it.
    pub fn spawn(picture_id: PictureId, registry: Arc<SessionRegistry>) -> RoomHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let room_id = Uuid::new_v4();
        let actor = Self {
            room_id,
            state: RoomState::new(picture_id),
            connections: HashMap::new(),
            registry,
        };
        tokio::spawn(actor.run(receiver));

        RoomHandle { room_id, picture_id, sender }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<RoomCommand>) {
        let picture_id = self.state.picture_id();
        info!(room_id = %self.room_id, picture_id, "room opened");

        while let Some(command) = receiver.recv().await {
            self.handle(command);

            if self.state.is_empty()
                && self.registry.drop_if_empty(picture_id, self.room_id, &receiver)
            {
                break;
            }
        }

        info!(room_id = %self.room_id, picture_id, "room closed");
    }

    /// Applies a command, then removes any connection its deliveries cut off
    /// as a slow consumer. Those removals can cut off further connections.
    fn handle(&mut self, command: RoomCommand) {
        let mut pending = VecDeque::from([command]);
        while let Some(command) = pending.pop_front() {
            let cut_off = self.apply_command(command);
            pending.extend(cut_off.into_iter().map(|connection_id| RoomCommand::Leave {
                connection_id,
                reason: LeaveReason::SlowConsumer,
            }));
        }
    }

    fn apply_command(&mut self, command: RoomCommand) -> Vec<Uuid> {
        let event = match command {
            RoomCommand::Join(connection) => {
                let participant = connection.participant();
                self.connections.insert(connection.id(), connection);
                RoomEvent::Join(participant)
            }
            RoomCommand::Inbound { connection_id, message } => {
                debug!(
                    room_id = %self.room_id,
                    connection_id = %connection_id,
                    kind = message.kind(),
                    "routing message into room"
                );
                match message {
                    ClientMessage::Join { .. } | ClientMessage::StateSync { .. } => {
                        RoomEvent::Sync(connection_id)
                    }
                    ClientMessage::EnterEdit { .. } => RoomEvent::EnterEdit(connection_id),
                    ClientMessage::EditAction { payload, .. } => {
                        RoomEvent::EditAction(connection_id, payload)
                    }
                    ClientMessage::ExitEdit { .. } => RoomEvent::ExitEdit(connection_id),
                    ClientMessage::Leave { .. } => {
                        RoomEvent::Leave(connection_id, LeaveReason::Left)
                    }
                }
            }
            RoomCommand::Leave { connection_id, reason } => RoomEvent::Leave(connection_id, reason),
        };

        let leaving = match &event {
            RoomEvent::Leave(connection_id, reason) => Some((*connection_id, *reason)),
            _ => None,
        };
        let dispatches = self.state.apply(event);

        if let Some((connection_id, reason)) = leaving {
            if self.connections.remove(&connection_id).is_some() {
                metrics::record_leave(reason);
                info!(
                    room_id = %self.room_id,
                    connection_id = %connection_id,
                    reason = reason.as_str(),
                    remaining = self.state.participants().len(),
                    "participant left room"
                );
            }
        }

        dispatches.into_iter().flat_map(|dispatch| self.deliver(dispatch)).collect()
    }

    fn deliver(&self, dispatch: Dispatch) -> Vec<Uuid> {
        match dispatch.recipients {
            Recipients::Only(connection_id) => self
                .connections
                .get(&connection_id)
                .filter(|connection| broadcast::send_to(connection, &dispatch.message))
                .map(|connection| vec![connection.id()])
                .unwrap_or_default(),
            Recipients::All => {
                broadcast::fan_out(self.ordered_connections(None), &dispatch.message)
            }
            Recipients::AllExcept(excluded) => {
                broadcast::fan_out(self.ordered_connections(Some(excluded)), &dispatch.message)
            }
        }
    }

    fn ordered_connections(&self, excluded: Option<Uuid>) -> Vec<&Arc<Connection>> {
        self.state
            .participants()
            .iter()
            .filter(|participant| Some(participant.connection_id) != excluded)
            .filter_map(|participant| self.connections.get(&participant.connection_id))
            .collect()
    }
}
