//! Launcher configuration, argument lists and script templates

mod args;
mod launcher_config;
mod template;

pub use args::*;
pub use launcher_config::*;
pub use template::*;
