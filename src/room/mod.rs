//! Room runtime: state, events and the phase state machine

pub mod events;
pub mod processor;
pub mod types;

pub use events::{RoomEvent, RoomMessage};
pub use processor::{RoomDeps, RoomProcessor};
pub use types::{Phase, RoomSnapshot};
