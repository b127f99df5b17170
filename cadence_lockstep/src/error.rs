// Engine error types.
//
// Each variant maps to a stable numeric code so failure notifications can
// carry the code over the wire (`CommandFailed`) and integrators can match
// on it without parsing messages. Codes below 100 belong to the engines;
// the relay's transport errors start at 100.

use thiserror::Error;

use cadence_protocol::types::{CommandId, PlayerNumber, TurnNumber};

/// Errors surfaced by the lockstep engines.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LockstepError {
    /// A confirmed turn arrived out of order. Fatal: the receiving engine
    /// must be stopped rather than continue from an inconsistent log.
    #[error("expected turn {}, got {}", expected.0, got.0)]
    TurnOutOfOrder {
        expected: TurnNumber,
        got: TurnNumber,
    },
    /// A command claimed a player number with no ready client behind it.
    #[error("player {} is not ready", player.0)]
    PlayerNotReady { player: PlayerNumber },
    /// A command id was already admitted for this player. The duplicate is
    /// dropped so it can never be sealed twice.
    #[error("duplicate command {} from player {}", id.0, player.0)]
    DuplicateCommand { player: PlayerNumber, id: CommandId },
    /// A command was submitted while no match was running.
    #[error("match is not running")]
    MatchNotRunning,
}

impl LockstepError {
    /// Stable numeric code for wire-level failure notifications.
    pub fn code(&self) -> u32 {
        match self {
            Self::TurnOutOfOrder { .. } => 1,
            Self::PlayerNotReady { .. } => 2,
            Self::DuplicateCommand { .. } => 3,
            Self::MatchNotRunning => 4,
        }
    }
}
