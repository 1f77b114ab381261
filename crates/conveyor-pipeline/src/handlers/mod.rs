//! Built-in stage handlers.

pub mod command;

pub use command::{parse_directives, CommandHandler, DEFAULT_COMMAND_TIMEOUT};
