// Process-wide map of open rooms and live connections.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use picsync_common::types::PictureId;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use super::{
    connection::Connection,
    room::{RoomActor, RoomCommand, RoomHandle},
};
use crate::metrics;

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<PictureId, RoomHandle>,
    connections: HashMap<Uuid, Arc<Connection>>,
}

/// Owns the picture to room mapping.
///
/// The map lock is only held for bookkeeping, never across an await. Joins
/// enqueue into the room's mailbox while holding it, and rooms are removed
/// only when their mailbox is empty under the same lock, so a join racing
/// with the last departure always lands in a live room.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the room for `picture_id`, spawning it on first use.
    pub fn get_or_create_room(self: &Arc<Self>, picture_id: PictureId) -> RoomHandle {
        let mut inner = self.inner.lock().expect("session registry lock poisoned");
        self.room_locked(&mut inner, picture_id)
    }

    fn room_locked(
        self: &Arc<Self>,
        inner: &mut RegistryInner,
        picture_id: PictureId,
    ) -> RoomHandle {
        inner
            .rooms
            .entry(picture_id)
            .or_insert_with(|| {
                metrics::add_rooms_active(1);
                RoomActor::spawn(picture_id, Arc::clone(self))
            })
            .clone()
    }

    /// Registers a connection and enqueues its JOIN into the picture's room.
    pub fn join(self: &Arc<Self>, connection: Arc<Connection>) -> RoomHandle {
        let mut inner = self.inner.lock().expect("session registry lock poisoned");
        let room = self.room_locked(&mut inner, connection.picture_id());
        inner.connections.insert(connection.id(), Arc::clone(&connection));
        room.send(RoomCommand::Join(connection));
        room
    }

    /// Forgets a connection once its socket task has finished.
    pub fn unregister_connection(&self, connection_id: Uuid) {
        let mut inner = self.inner.lock().expect("session registry lock poisoned");
        inner.connections.remove(&connection_id);
    }

    /// Sends a command to the picture's room if it is open.
    pub fn send_to_room(&self, picture_id: PictureId, command: RoomCommand) -> bool {
        let inner = self.inner.lock().expect("session registry lock poisoned");
        inner.rooms.get(&picture_id).is_some_and(|room| room.send(command))
    }

    /// Called by a room actor whose participant set just became empty.
    /// Returns true when the room was removed and the actor should stop.
    pub(crate) fn drop_if_empty(
        &self,
        picture_id: PictureId,
        room_id: Uuid,
        mailbox: &mpsc::UnboundedReceiver<RoomCommand>,
    ) -> bool {
        let mut inner = self.inner.lock().expect("session registry lock poisoned");
        match inner.rooms.get(&picture_id) {
            Some(room) if room.room_id() == room_id => {
                if !mailbox.is_empty() {
                    return false;
                }
                inner.rooms.remove(&picture_id);
                metrics::add_rooms_active(-1);
                info!(picture_id, room_id = %room_id, "dropping empty room");
                true
            }
            // Not the registered room for this picture; nothing routes here.
            _ => true,
        }
    }

    pub fn room(&self, picture_id: PictureId) -> Option<RoomHandle> {
        self.inner.lock().expect("session registry lock poisoned").rooms.get(&picture_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().expect("session registry lock poisoned").rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().expect("session registry lock poisoned").connections.len()
    }

    pub fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .connections
            .values()
            .cloned()
            .collect()
    }
}
