//! Shared data model for a sable session: the identifier triple, the
//! append-only [`Event`] record and the [`Message`] variants exchanged with
//! model providers. This crate is I/O-free; persistence lives in
//! `sable-core`.

mod event;
mod message;
mod session;

pub use event::Event;
pub use event::EventMeta;
pub use event::Lifecycle;
pub use event::LifecyclePhase;
pub use event::LifecycleStatus;
pub use event::meta;
pub use message::Message;
pub use message::Role;
pub use message::ToolCall;
pub use message::ToolResponse;
pub use session::InvalidSessionId;
pub use session::SessionId;
pub use session::workspace_key;
