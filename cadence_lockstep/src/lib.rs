// Deterministic lockstep turn engines.
//
// The client engine buffers locally produced commands and consumes the
// confirmed turn stream against a local clock; the server engine collects
// commands from all players and seals them into authoritative, gapless,
// canonically ordered turns. Both are transport-free and callback-free:
// callers feed in time deltas and messages, and read back events as
// return values. `cadence_relay` wires them to the network.

pub mod client;
pub mod error;
pub mod server;
pub mod stats;

pub use client::ClientEngine;
pub use error::LockstepError;
pub use server::{EMPTY_TURN_BATCH, ServerEngine, ServerEvent};
pub use stats::TurnBufferStats;
