//! Function-calling tools: registration table, argument validation and
//! the dispatcher that runs them.

pub mod dispatcher;
pub mod registry;
pub mod schema;

pub use dispatcher::Dispatcher;
pub use registry::{ToolHandler, ToolRegistration, ToolRegistry};
