// Protocol messages for client-server communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by game clients to the lockstep server.
// - `ServerMessage`: sent by the lockstep server to game clients.
//
// All types derive `Serialize`/`Deserialize` for JSON framing (see
// `framing.rs`). Opaque structured payloads (match results, game
// parameters) are carried as `serde_json::Value` — the core only moves
// them, the game layer gives them meaning.
//
// `Ping`/`Pong` exist in both directions: each side stamps a `Ping` with
// its own clock and the peer echoes the stamp back unchanged, feeding the
// round-trip estimator used for start-time correction.

use serde::{Deserialize, Serialize};

use crate::config::LockstepConfig;
use crate::turn::{Command, Turn};
use crate::types::{CommandId, PlayerNumber, PlayerToken, TurnNumber};

/// Messages sent by a client to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Clock probe; the server echoes it back as `Pong`.
    Ping { sent_ms: i64 },
    /// Echo of a server `Ping`.
    Pong { sent_ms: i64 },
    /// Readiness plus the resume point to backfill from on (re)join.
    PlayerReady {
        token: PlayerToken,
        current_turn: TurnNumber,
        version: String,
    },
    /// A local input command for an upcoming turn.
    Command { command: Command },
    /// Match-end submission with this player's result.
    PlayerFinish { result: serde_json::Value },
    /// Per-turn state hash for desync detection.
    Checksum { turn: TurnNumber, hash: u64 },
    /// Player is leaving gracefully.
    Goodbye,
}

/// Messages sent by the server to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Clock probe; the client echoes it back as `Pong`.
    Ping { sent_ms: i64 },
    /// Echo of a client `Ping`.
    Pong { sent_ms: i64 },
    /// Pre-ready configuration push, sent as soon as a connection is
    /// accepted. Readiness before this has arrived is meaningless.
    ClientSetup {
        config: LockstepConfig,
        game_params: serde_json::Value,
    },
    /// Start negotiation: a server clock sample, the adjusted start time,
    /// and the roster in ascending player-number order.
    ClientStart {
        server_time_ms: i64,
        start_time_ms: i64,
        players: Vec<String>,
    },
    /// A sealed non-empty turn.
    Turn { turn: Turn },
    /// A run of consecutive empty turns. The count is a single byte; runs
    /// above 255 chain across messages.
    EmptyTurns { count: u8 },
    /// A previously submitted command was rejected. Clients must not retry
    /// automatically.
    CommandFailed {
        player: PlayerNumber,
        command: CommandId,
        code: u32,
        reason: String,
    },
    /// Final result delivery; the client engine stops after this.
    ClientEnd { result: serde_json::Value },
    /// A peer's connection came up or went down.
    ClientConnectionStatus { player: PlayerNumber, connected: bool },
    /// Readiness refused (match full, already ended, version mismatch).
    Rejected { reason: String },
    /// Checksum divergence between peers at a turn.
    DesyncDetected { turn: TurnNumber },
}
