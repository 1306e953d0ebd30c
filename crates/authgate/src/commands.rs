//! The `/2fa` command surface.
//!
//! ```text
//! /2fa                         set up 2FA (enable)
//! /2fa <code...>               submit a code
//! /2fa enable                  aliases: setup on activate true add
//! /2fa disable [player...]     aliases: remove reset off deactivate false
//! /2fa reload                  alias:   rl
//! ```
//!
//! `/twofactor` and `/tfa` are the same command
//! (see [`CODE_COMMAND_ALIASES`](crate::CODE_COMMAND_ALIASES)).
//!
//! Parsing is pure ([`Command::parse`]); running a command needs an
//! [`AuthNode`](crate::AuthNode) and a [`CommandSender`], see
//! [`AuthNode::command`](crate::AuthNode::command). Outcomes are values;
//! the adapter turns them into chat messages.

use authgate_protocol::PlayerId;
use authgate_session::Enrollment;

use crate::CodeResult;

pub const PERMISSION_SETUP: &str = "2fa.setup";
pub const PERMISSION_REMOVE_OTHERS: &str = "2fa.remove.others";
pub const PERMISSION_RELOAD: &str = "2fa.reload";

const ENABLE_ALIASES: &[&str] = &["enable", "setup", "on", "activate", "true", "add"];
const DISABLE_ALIASES: &[&str] = &["disable", "remove", "reset", "off", "deactivate", "false"];
const RELOAD_ALIASES: &[&str] = &["reload", "rl"];

/// Whoever ran the command, as the host sees them.
pub trait CommandSender {
    /// `None` for the console.
    fn player_id(&self) -> Option<PlayerId>;

    fn has_permission(&self, permission: &str) -> bool;

    /// Maps a command argument to a player. The default accepts UUIDs;
    /// adapters override it to look up names.
    fn resolve_player(&self, name: &str) -> Option<PlayerId> {
        name.parse().ok()
    }
}

/// A parsed `/2fa` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enable,
    Disable { targets: Vec<String> },
    Reload,
    Submit { code: Vec<String> },
}

impl Command {
    /// Parses the arguments after `/2fa`.
    pub fn parse<A: AsRef<str>>(args: &[A]) -> Self {
        let Some((first, rest)) = args.split_first() else {
            return Self::Enable;
        };
        let first = first.as_ref().to_ascii_lowercase();
        let rest = || rest.iter().map(|a| a.as_ref().to_string()).collect::<Vec<_>>();

        if ENABLE_ALIASES.contains(&first.as_str()) {
            Self::Enable
        } else if DISABLE_ALIASES.contains(&first.as_str()) {
            Self::Disable { targets: rest() }
        } else if RELOAD_ALIASES.contains(&first.as_str()) {
            Self::Reload
        } else {
            Self::Submit {
                code: args.iter().map(|a| a.as_ref().to_string()).collect(),
            }
        }
    }
}

/// What a command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The console tried a player-only command.
    MustBePlayer,
    NoPermission,
    /// New secret and provisioning URI for the player.
    Enrolled(Enrollment),
    AlreadySetUp,
    /// The sender has no 2FA to disable or no code to check against.
    NotSetUp,
    /// The sender's own 2FA was disabled.
    Disabled,
    /// 2FA was disabled for each player in `reset`; names in `unknown`
    /// didn't resolve.
    DisabledOthers {
        reset: Vec<PlayerId>,
        unknown: Vec<String>,
    },
    /// Config reloaded; `kept` connected players kept their state.
    Reloaded { kept: usize },
    Code(CodeResult),
}
