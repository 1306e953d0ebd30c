//! The gate: may this player do this right now?
//!
//! Host adapters translate their own events (a move packet, a chat line,
//! a command, a proxy server switch) into an [`Action`] and ask
//! [`Gate::check`]. Anything gated is allowed only for `Verified` players.
//! The adapter cancels the event on [`Decision::Deny`] and tells the
//! player why; message wording is the adapter's business.

use authgate_protocol::{AuthState, PlayerId};
use authgate_session::{AuthService, SessionError, StateSource, VerifyOutcome};
use authgate_totp::normalize_code;

use crate::GateConfig;

/// The command players type their code into. Never gated.
pub const CODE_COMMAND: &str = "2fa";

/// Every label the code command answers to, [`CODE_COMMAND`] first.
/// Adapters register the command under all of them; none is ever gated.
pub const CODE_COMMAND_ALIASES: &[&str] = &[CODE_COMMAND, "twofactor", "tfa"];

/// `true` if `label` (no slash, any case) names the code command.
pub fn is_code_command(label: &str) -> bool {
    CODE_COMMAND_ALIASES
        .iter()
        .any(|alias| alias.eq_ignore_ascii_case(label))
}

/// A gameplay action a player is attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    Move,
    Chat,
    /// The full command line, with or without the leading `/`.
    Command(&'a str),
    ServerSwitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Cancel the action. `state` tells the adapter whether to prompt for
    /// setup (`Unregistered`) or for a code (`Pending`).
    Deny { state: AuthState },
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// What happened to a code submitted through [`Gate::submit_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeResult {
    Verified,
    AlreadyVerified,
    /// The player has no secret yet; they need `/2fa` first.
    NotSetUp,
    /// Not the right number of digits. Not counted as a failure.
    Malformed,
    /// Wrong or replayed. `attempts_left` is `None` when kicking is off.
    Rejected { attempts_left: Option<u32> },
    /// Too many wrong codes in a row; the adapter should disconnect them.
    Kick,
}

/// Answers gate checks against a [`StateSource`].
///
/// On a standalone server or a proxy the source is the local
/// [`AuthService`]; on a backend it is the sync client, which may fail
/// closed when the proxy can't be reached.
#[derive(Debug, Clone)]
pub struct Gate<S> {
    source: S,
    config: GateConfig,
}

impl<S: StateSource> Gate<S> {
    pub fn new(source: S, config: GateConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// `true` if `action` needs a verified player under this config.
    pub fn is_gated(&self, action: Action<'_>) -> bool {
        match action {
            Action::Move => self.config.block_movement,
            Action::Chat => self.config.block_chat,
            Action::ServerSwitch => self.config.block_server_switch,
            Action::Command(line) => {
                let Some(label) = command_label(line) else {
                    return self.config.block_commands;
                };
                if is_code_command(&label) {
                    false
                } else if contains(&self.config.blacklisted_commands, &label) {
                    true
                } else if contains(&self.config.whitelisted_commands, &label) {
                    false
                } else {
                    self.config.block_commands
                }
            }
        }
    }

    pub async fn check(&self, player_id: PlayerId, action: Action<'_>) -> Decision {
        if !self.is_gated(action) {
            return Decision::Allow;
        }
        let state = self.source.query_state(player_id).await;
        if state.is_verified() {
            Decision::Allow
        } else {
            tracing::debug!(%player_id, ?action, %state, "action blocked");
            Decision::Deny { state }
        }
    }

    /// Handles `/2fa <code...>`. The arguments are joined, so `123 456`
    /// and `123456` are the same code.
    ///
    /// # Errors
    /// [`SessionError::StorageUnavailable`] if the secret can't be read.
    /// The player stays as they were.
    pub async fn submit_code<A: AsRef<str>>(
        &self,
        service: &AuthService,
        player_id: PlayerId,
        args: &[A],
    ) -> Result<CodeResult, SessionError> {
        match service.get_state(player_id) {
            AuthState::Unregistered => return Ok(CodeResult::NotSetUp),
            AuthState::Verified => return Ok(CodeResult::AlreadyVerified),
            AuthState::Pending => {}
        }

        let digits = service.totp().config().digits;
        let Some(code) = normalize_code(args.iter().map(AsRef::as_ref), digits) else {
            return Ok(CodeResult::Malformed);
        };

        match service.verify(player_id, &code).await? {
            VerifyOutcome::Accepted => Ok(CodeResult::Verified),
            VerifyOutcome::Rejected {
                consecutive_failures,
            } => {
                let max = self.config.max_failed_attempts;
                if max == 0 {
                    Ok(CodeResult::Rejected {
                        attempts_left: None,
                    })
                } else if consecutive_failures >= max {
                    tracing::info!(%player_id, consecutive_failures, "too many wrong codes, kicking");
                    Ok(CodeResult::Kick)
                } else {
                    Ok(CodeResult::Rejected {
                        attempts_left: Some(max - consecutive_failures),
                    })
                }
            }
        }
    }
}

/// Lowercased command name from a command line: `/Minecraft:TP x` → `tp`.
fn command_label(line: &str) -> Option<String> {
    let first = line.trim_start().trim_start_matches('/').split_whitespace().next()?;
    let label = first.rsplit(':').next().unwrap_or(first);
    (!label.is_empty()).then(|| label.to_ascii_lowercase())
}

fn contains(list: &[String], label: &str) -> bool {
    list.iter()
        .any(|entry| entry.trim_start_matches('/').eq_ignore_ascii_case(label))
}
