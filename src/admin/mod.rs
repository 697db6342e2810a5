//! Administrative console.
//!
//! Operators connect over TCP and type one command per line to inspect
//! targets or change the group layout at runtime. Sending a blank line
//! switches the session to interactive mode with a prompt.

mod command;
mod console;

pub use command::{Command, CommandError, TargetRef, HELP};
pub use console::{execute, AdminConsole, ConsoleContext, Reply};
