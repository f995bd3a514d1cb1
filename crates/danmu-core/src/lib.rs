//! danmu-core: shared types, IDs, errors and configuration.
//!
//! This crate is the foundational dependency of `danmu-sync`, providing
//! type-safe identifiers, a unified error type, the library entity and
//! change-event model, and the serde configuration tree.

pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use entity::{EntityKind, EntityRef, ProviderIds};
pub use error::{Error, Result};
pub use events::{EventType, LibraryEvent};
pub use ids::*;
