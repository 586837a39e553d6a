//! Room registry: resolves which chats receive a relayed message.

use metachat_types::error::{MetachatError, MetachatResult};
use metachat_types::message::{normalize_name, Chat, Message, Room};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Immutable room table, validated once at startup.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    /// Rooms in configuration order, with duplicate chats removed.
    rooms: Vec<Room>,
    /// Normalized room name -> index into `rooms`.
    by_name: HashMap<String, usize>,
    /// (normalized backend, chat id) -> index of the room that lists it.
    by_chat: HashMap<(String, String), usize>,
}

impl RoomRegistry {
    /// Validate `rooms` against the registered backend names.
    ///
    /// Fails when a room references an unregistered backend, when two rooms
    /// share a normalized name, or when a chat appears in more than one room.
    /// A chat listed twice in the same room is kept once.
    pub fn build<'a>(
        rooms: &[Room],
        backends: impl IntoIterator<Item = &'a str>,
    ) -> MetachatResult<Self> {
        let known: HashSet<String> = backends.into_iter().map(normalize_name).collect();
        let mut registry = Self::default();

        for room in rooms {
            let key = normalize_name(&room.name);
            if registry.by_name.contains_key(&key) {
                return Err(MetachatError::DuplicateRoom(room.name.clone()));
            }
            let index = registry.rooms.len();
            let mut chats = Vec::with_capacity(room.chats.len());

            for chat in &room.chats {
                let backend = normalize_name(&chat.backend);
                if !known.contains(&backend) {
                    return Err(MetachatError::UnknownBackend {
                        room: room.name.clone(),
                        backend: chat.backend.clone(),
                    });
                }
                match registry.by_chat.get(&(backend.clone(), chat.id.clone())) {
                    Some(&other) if other == index => {
                        warn!(room = %room.name, chat = %chat, "Duplicate chat in room, ignoring");
                        continue;
                    }
                    Some(&other) => {
                        return Err(MetachatError::ChatInMultipleRooms {
                            backend: chat.backend.clone(),
                            chat: chat.id.clone(),
                            first: registry.rooms[other].name.clone(),
                            second: room.name.clone(),
                        });
                    }
                    None => {}
                }
                registry.by_chat.insert((backend, chat.id.clone()), index);
                chats.push(chat.clone());
            }

            if chats.len() < 2 {
                warn!(room = %room.name, chats = chats.len(), "Room has nothing to relay between");
            }
            debug!(room = %room.name, chats = chats.len(), "Room registered");
            registry.by_name.insert(key, index);
            registry.rooms.push(Room {
                name: room.name.clone(),
                chats,
            });
        }

        Ok(registry)
    }

    /// Every chat sharing a room with the message's origin, minus the origin.
    ///
    /// Messages from chats outside every room have no targets.
    pub fn targets_for(&self, message: &Message) -> Vec<Chat> {
        let key = (normalize_name(&message.backend), message.chat.clone());
        match self.by_chat.get(&key) {
            Some(&index) => self.rooms[index]
                .chats
                .iter()
                .filter(|chat| !message.is_from(chat))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Find a room by name (normalized before lookup).
    pub fn lookup_by_name(&self, name: &str) -> Option<&Room> {
        self.by_name
            .get(&normalize_name(name))
            .map(|&index| &self.rooms[index])
    }

    /// All rooms, in configuration order.
    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.iter()
    }

    /// Number of rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
