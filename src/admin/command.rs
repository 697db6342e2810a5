//! Console command parsing.

use std::fmt;
use thiserror::Error;

/// A target named on the console as `<group> <host> <port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub group: usize,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in group {}", self.host, self.port, self.group)
    }
}

/// One console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stats,
    MemStats,
    Conns,
    Add(TargetRef),
    Remove(TargetRef),
    AddGroup(usize),
    RemoveGroup(usize),
    Enable(TargetRef),
    Disable(TargetRef),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}\nTry 'help' for a list of commands")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("{0} must be an integer")]
    NotAnInteger(&'static str),
}

pub const HELP: &str = "\
Commands:
  stats                              per-target state and counters
  memstats                           sizes of internal tables
  conns                              live connections per target
  add <group> <host> <port>          add a target to a group
  remove <group> <host> <port>       remove a target and drop its connections
  addgroup <index>                   insert an empty group
  removegroup <index>                remove a group and all its targets
  enable <group> <host> <port>       enable a target
  disable <group> <host> <port>      disable a target
  help                               show this list
  quit                               close the session";

impl Command {
    /// Parse one console line. A blank line yields `None`.
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match name {
            "stats" => Command::Stats,
            "memstats" => Command::MemStats,
            "conns" => Command::Conns,
            "add" => Command::Add(target_ref(&args, "add <group> <host> <port>")?),
            "remove" => Command::Remove(target_ref(&args, "remove <group> <host> <port>")?),
            "addgroup" => Command::AddGroup(group_index(&args, "addgroup <index>")?),
            "removegroup" => Command::RemoveGroup(group_index(&args, "removegroup <index>")?),
            "enable" => Command::Enable(target_ref(&args, "enable <group> <host> <port>")?),
            "disable" => Command::Disable(target_ref(&args, "disable <group> <host> <port>")?),
            "help" => Command::Help,
            "quit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

fn target_ref(args: &[&str], usage: &'static str) -> Result<TargetRef, CommandError> {
    let [group, host, port] = args else {
        return Err(CommandError::Usage(usage));
    };
    Ok(TargetRef {
        group: group.parse().map_err(|_| CommandError::NotAnInteger("Target group"))?,
        host: (*host).to_string(),
        port: port.parse().map_err(|_| CommandError::NotAnInteger("Port"))?,
    })
}

fn group_index(args: &[&str], usage: &'static str) -> Result<usize, CommandError> {
    let [index] = args else {
        return Err(CommandError::Usage(usage));
    };
    index.parse().map_err(|_| CommandError::NotAnInteger("Target group"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_line() {
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(Command::parse("   \t").unwrap(), None);
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(Command::parse("stats").unwrap(), Some(Command::Stats));
        assert_eq!(Command::parse(" memstats ").unwrap(), Some(Command::MemStats));
        assert_eq!(Command::parse("quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_target_commands() {
        let expected = TargetRef {
            group: 1,
            host: "backend.local".to_string(),
            port: 8080,
        };
        assert_eq!(
            Command::parse("add 1 backend.local 8080").unwrap(),
            Some(Command::Add(expected.clone()))
        );
        assert_eq!(
            Command::parse("disable 1 backend.local 8080").unwrap(),
            Some(Command::Disable(expected))
        );
    }

    #[test]
    fn test_group_commands() {
        assert_eq!(Command::parse("addgroup 0").unwrap(), Some(Command::AddGroup(0)));
        assert_eq!(Command::parse("removegroup 2").unwrap(), Some(Command::RemoveGroup(2)));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            Command::parse("frobnicate").unwrap_err(),
            CommandError::Unknown("frobnicate".to_string())
        );
        assert_eq!(
            Command::parse("add 0 host").unwrap_err(),
            CommandError::Usage("add <group> <host> <port>")
        );
        assert_eq!(
            Command::parse("add x host 80").unwrap_err(),
            CommandError::NotAnInteger("Target group")
        );
        assert_eq!(
            Command::parse("enable 0 host 99999").unwrap_err(),
            CommandError::NotAnInteger("Port")
        );
        assert_eq!(
            Command::parse("addgroup").unwrap_err(),
            CommandError::Usage("addgroup <index>")
        );
    }
}
