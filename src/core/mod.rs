//! Core bridge machinery, independent of the HTTP surface.

pub mod credentials;
pub mod session;
pub mod tasks;
pub mod tools;
pub mod upstream;
