// Core ID types for the lockstep protocol.
//
// These are lightweight newtypes shared by `turn.rs` / `message.rs` (wire
// types) and the relay's session management (`cadence_relay::session`).
// Two of them deliberately model the same person from different angles:
// `ClientId` names a live connection and dies with it, while `PlayerToken`
// names the player and survives reconnects. They are joined by a lookup on
// the server, never conflated into one field.

use serde::{Deserialize, Serialize};

/// Stable per-match player slot. Assigned once from the lowest unused
/// number when a token first reports ready; never reused while the owning
/// entry exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerNumber(pub u8);

/// Command id, monotonic per issuing client and unique within a match for
/// that player. Correlates failure notifications and deduplicates replays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u32);

/// Monotonically increasing turn number, starting at 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnNumber(pub u32);

/// Transient connection id assigned by the server per accepted link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

/// Durable player identity. Survives disconnects so a rejoining player
/// reclaims the same `PlayerNumber`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerToken(pub String);

impl PlayerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}
