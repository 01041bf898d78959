//! Task service integration: REST client and the built-in tools that
//! expose it to the model.

pub mod client;
pub mod tools;

pub use client::{NewTask, Project, Task, TaskClient};
pub use tools::task_tool_registry;
