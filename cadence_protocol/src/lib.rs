// cadence_protocol — wire protocol for lockstep synchronization.
//
// This crate defines the message types, framing, and serialization used by
// the lockstep server (`cadence_relay`) and game clients to communicate
// over TCP. It is shared between both sides and has no dependency on the
// engines or any game simulation.
//
// Module overview:
// - `types.rs`:    Core ID types — `PlayerNumber`, `CommandId`, `TurnNumber`,
//                  `ClientId`, `PlayerToken`.
// - `turn.rs`:     `Command` and `Turn` models plus the empty-turn
//                  run-length chunking helper.
// - `config.rs`:   `LockstepConfig`, pushed to clients in `ClientSetup`.
// - `message.rs`:  Client-to-server and server-to-client message enums.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Binary framing can be swapped in later if
//   bandwidth matters; the length-prefix format is already encoding-blind.
// - **Commands as opaque `Vec<u8>`.** The server never inspects command
//   payloads, so the protocol stays independent of any game's action types.
// - **No async runtime.** Uses `std::io::Read`/`Write` for framing,
//   compatible with blocking TCP streams and buffered wrappers.

pub mod config;
pub mod framing;
pub mod message;
pub mod turn;
pub mod types;

pub use config::LockstepConfig;
pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use message::{ClientMessage, ServerMessage};
pub use turn::{Command, Turn, empty_turn_chunks};
pub use types::{ClientId, CommandId, PlayerNumber, PlayerToken, TurnNumber};
