//! Service description parsing and variable expansion

mod service_file;
mod substitution;

pub use service_file::*;
pub use substitution::*;
