//! Runtime components for command execution and process management

pub mod exec;
pub mod process;
pub mod recording;

pub use exec::*;
pub use process::*;
pub use recording::*;
