//! Interactive console
//!
//! Reads one command per line from stdin and forwards it to the session
//! worker. Inbound messages and connection state changes are printed as
//! they arrive.

pub mod command;
#[allow(clippy::module_inception)]
pub mod console;

pub use command::{Command, CommandError};
pub use console::Console;
