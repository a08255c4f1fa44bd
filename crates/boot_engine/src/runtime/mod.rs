//! Runtime components: dependency graph, scheduling, supervision

pub mod dependency;
pub mod engine;
pub mod process;
pub mod scheduler;

pub use dependency::*;
pub use engine::*;
pub use process::*;
pub use scheduler::*;
