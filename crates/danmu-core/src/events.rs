//! Library change events delivered by the host.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::EntityRef;

/// Intent of a library change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// The entity was just added to the library.
    Add,
    /// The entity's metadata changed.
    Update,
    /// Explicit request to re-download using an already chosen provider.
    Force,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Force => "force",
        };
        f.write_str(s)
    }
}

/// A change notification for one entity. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEvent {
    pub entity: EntityRef,
    pub event_type: EventType,
}

impl LibraryEvent {
    pub fn new(entity: EntityRef, event_type: EventType) -> Self {
        Self { entity, event_type }
    }

    pub fn add(entity: EntityRef) -> Self {
        Self::new(entity, EventType::Add)
    }

    pub fn update(entity: EntityRef) -> Self {
        Self::new(entity, EventType::Update)
    }

    pub fn force(entity: EntityRef) -> Self {
        Self::new(entity, EventType::Force)
    }
}
