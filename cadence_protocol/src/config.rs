// Match configuration.
//
// `LockstepConfig` is immutable for the lifetime of a match, set before
// start, and pushed to every client in `ClientSetup` before readiness is
// meaningful. Both engines derive their sealing/consumption cadence from
// `turn_duration_ms`, so there is exactly one place the interval lives.

use serde::{Deserialize, Serialize};

/// Engine and lifecycle configuration for one match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Player slots in the match. The match starts when this many players
    /// are ready (unless `allow_match_start_with_one_player_ready`).
    pub max_players: u8,
    /// Fixed interval between sealed turns, shared by both engines.
    pub turn_duration_ms: u32,
    /// Offset subtracted from the server timestamp when scheduling client
    /// start times.
    pub client_start_delay_ms: u32,
    /// Deliberate sealing delay on the server, absorbing one-way network
    /// lag before clients need a turn.
    pub client_simulation_delay_ms: u32,
    /// Grace period before force-ending a match that a client claims is
    /// over but the authoritative check disputes.
    pub match_ended_without_confirmation_timeout_secs: u32,
    /// Treat a disconnect as excluding that player from the finish count,
    /// re-evaluating match end immediately.
    pub finish_on_client_disconnection: bool,
    /// Start as soon as one player is ready instead of waiting for a full
    /// roster.
    pub allow_match_start_with_one_player_ready: bool,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            max_players: 4,
            turn_duration_ms: 100,
            client_start_delay_ms: 1000,
            client_simulation_delay_ms: 1000,
            match_ended_without_confirmation_timeout_secs: 30,
            finish_on_client_disconnection: true,
            allow_match_start_with_one_player_ready: false,
        }
    }
}
