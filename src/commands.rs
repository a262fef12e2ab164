//! Messages accepted on the agent's command channel.
//!
//! On the wire they are JSON objects tagged by `type`:
//! `{"type":"SKIP_WAITING"}`, `{"type":"CLIENTS_CLAIM"}`, `{"type":"GET_VERSION"}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommand {
  /// Activate the waiting generation now
  SkipWaiting,
  /// Take control of every connected client
  ClientsClaim,
  /// Reply with the active cache version
  GetVersion,
}

/// Reply to `GET_VERSION`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
  pub version: String,
}

#[derive(Debug, Clone)]
pub struct CommandInfo {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
  pub command: AgentCommand,
}

/// All available commands, as named on the command line
pub const COMMANDS: &[CommandInfo] = &[
  CommandInfo {
    name: "skip-waiting",
    aliases: &["SKIP_WAITING", "activate"],
    description: "Activate the waiting generation and evict stale stores",
    command: AgentCommand::SkipWaiting,
  },
  CommandInfo {
    name: "clients-claim",
    aliases: &["CLIENTS_CLAIM", "claim"],
    description: "Take control of all connected clients",
    command: AgentCommand::ClientsClaim,
  },
  CommandInfo {
    name: "get-version",
    aliases: &["GET_VERSION", "version"],
    description: "Report the active cache version",
    command: AgentCommand::GetVersion,
  },
];

/// Find a command by name or alias (case-insensitive).
pub fn lookup(input: &str) -> Option<&'static CommandInfo> {
  let input = input.trim();
  COMMANDS.iter().find(|cmd| {
    cmd.name.eq_ignore_ascii_case(input) || cmd.aliases.iter().any(|a| a.eq_ignore_ascii_case(input))
  })
}
