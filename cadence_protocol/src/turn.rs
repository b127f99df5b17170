// Command and turn models.
//
// A `Command` is one player action: an id, the owning player number, and an
// opaque byte payload. The core never inspects payloads — the game layer
// serializes an action into bytes before submitting and decodes after a
// confirmed turn hands it back. This keeps the protocol crate independent
// of any game simulation.
//
// A `Turn` is the ordered set of commands sealed for one simulation tick.
// Turns are produced exactly once per tick interval by the server authority
// and are immutable after sealing; every peer's confirmed-turn log is a
// gapless sequence of them starting at 0. A turn with zero commands is
// "empty" and is normally carried on the wire as a run-length count rather
// than a discrete message (see `empty_turn_chunks`).

use serde::{Deserialize, Serialize};

use crate::types::{CommandId, PlayerNumber, TurnNumber};

/// A single player action. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub player: PlayerNumber,
    pub payload: Vec<u8>,
}

/// The commands sealed for one simulation tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub number: TurnNumber,
    pub commands: Vec<Command>,
}

impl Turn {
    /// An idle turn carrying no commands.
    pub fn empty(number: TurnNumber) -> Self {
        Self {
            number,
            commands: Vec::new(),
        }
    }

    /// True iff the turn carries no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Split a run of consecutive empty turns into the byte-sized counts the
/// wire format carries. The count field is a single byte, so runs above
/// 255 chain across multiple messages.
pub fn empty_turn_chunks(count: u32) -> Vec<u8> {
    let mut chunks = Vec::new();
    let mut remaining = count;
    while remaining > 0 {
        #[expect(clippy::cast_possible_truncation)]
        let chunk = remaining.min(255) as u8;
        chunks.push(chunk);
        remaining -= u32::from(chunk);
    }
    chunks
}
