//! World model: entity store, components, object lifecycle, avatar,
//! chat, and the sim thread that owns all of it.

pub mod avatar;
pub mod chat;
pub mod components;
pub mod lifecycle;
pub mod render;
pub mod sim;
pub mod store;

pub use components::{MovementState, VisualKind};
pub use lifecycle::{IncomingUpdate, ObjectLifecycle, UpdatePriority};
pub use render::{NullSink, RenderBridge, RenderSink, Transform};
pub use sim::{SimCommand, SimHandle, SimStats, WorldEvent};
pub use store::{ChangeClass, ChangeEvent, EntityId, EntityStore};
