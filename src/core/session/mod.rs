//! Session lifecycle: event model, state machine and live-session registry.

pub mod event;
pub mod machine;
pub mod registry;

pub use event::{Event, Role, SessionState};
pub use machine::{Action, SessionMachine};
pub use registry::{SessionHandle, SessionRegistry};
