// Client-side lockstep engine.
//
// Per-peer state machine that runs the local simulation clock, queues
// locally produced commands for transmission, and applies the
// authoritative turn stream in order. `Stopped → Running → Stopped`:
// `start` resets the clock and begins accepting `update` calls; `stop`
// clears buffered state.
//
// **Critical constraint: determinism.** The engine never reads a wall
// clock — time only advances through the deltas the integrator feeds into
// `update`, and the confirmed-turn log is append-only with strictly
// sequential numbers. A turn-number gap is a fatal protocol violation, not
// something to paper over: simulation state on every peer depends on the
// exact same stream.
//
// Event flow is by returned values, not callbacks: `update` returns the
// turns now due for application, `add_command` returns the assigned id,
// and queued transmissions drain through `take_outgoing`. The integrator
// (`cadence_relay::client`) forwards them.

use std::collections::{BTreeMap, VecDeque};

use cadence_protocol::turn::{Command, Turn};
use cadence_protocol::types::{CommandId, PlayerNumber, TurnNumber};

use crate::error::LockstepError;
use crate::stats::TurnBufferStats;

/// Client-side engine: local clock, outgoing command queue, confirmed-turn
/// log.
pub struct ClientEngine {
    turn_duration_ms: u32,
    player: PlayerNumber,
    running: bool,
    /// Elapsed simulation time in ms. Set by `start`, advanced by `update`.
    time_ms: i64,
    /// Next id handed to a locally produced command.
    next_command_id: u32,
    /// Commands produced locally, waiting for the integrator to transmit.
    outgoing: Vec<Command>,
    /// Commands transmitted but not yet sealed or failed, by id.
    pending: BTreeMap<CommandId, Command>,
    /// Confirmed turns not yet consumed by the game layer.
    confirmed: VecDeque<Turn>,
    /// Number the next confirmed turn must carry.
    next_confirmed: TurnNumber,
    /// Number of the next turn to hand to the game layer.
    next_consumed: TurnNumber,
    stats: TurnBufferStats,
}

impl ClientEngine {
    /// Create an engine expecting `first_turn` as the first confirmed turn
    /// (0 for a fresh match; the resume point when rejoining).
    pub fn new(turn_duration_ms: u32, player: PlayerNumber, first_turn: TurnNumber) -> Self {
        Self {
            turn_duration_ms,
            player,
            running: false,
            time_ms: 0,
            next_command_id: 1,
            outgoing: Vec::new(),
            pending: BTreeMap::new(),
            confirmed: VecDeque::new(),
            next_confirmed: first_turn,
            next_consumed: first_turn,
            stats: TurnBufferStats::default(),
        }
    }

    /// Transition to Running and reset the simulation clock to
    /// `start_time_ms` (elapsed ms since the negotiated match start; large
    /// when rejoining a match already in progress).
    pub fn start(&mut self, start_time_ms: i64) {
        self.running = true;
        self.time_ms = start_time_ms;
    }

    /// Transition to Stopped and clear buffered state. Confirmed turns not
    /// yet consumed are dropped; a rejoin backfills them from the resume
    /// point, which stays at the next unconsumed number.
    pub fn stop(&mut self) {
        self.running = false;
        self.outgoing.clear();
        self.pending.clear();
        self.confirmed.clear();
        self.next_confirmed = self.next_consumed;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn player(&self) -> PlayerNumber {
        self.player
    }

    pub fn time_ms(&self) -> i64 {
        self.time_ms
    }

    /// The next turn number this engine expects to confirm — the resume
    /// point advertised in a ready message.
    pub fn next_confirmed_turn(&self) -> TurnNumber {
        self.next_confirmed
    }

    /// Wrap a payload in a command with a locally generated id and queue it
    /// for transmission. Returns the id, or `None` (silent no-op) when not
    /// Running — late input during teardown must not crash.
    pub fn add_command(&mut self, payload: Vec<u8>) -> Option<CommandId> {
        if !self.running {
            return None;
        }
        let id = CommandId(self.next_command_id);
        self.next_command_id += 1;
        let command = Command {
            id,
            player: self.player,
            payload,
        };
        self.pending.insert(id, command.clone());
        self.outgoing.push(command);
        Some(id)
    }

    /// Drain the queue of commands waiting for transmission.
    pub fn take_outgoing(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outgoing)
    }

    /// Commands transmitted but not yet sealed into a confirmed turn or
    /// failed. A rejoining integrator may resubmit these; the server
    /// deduplicates by id.
    pub fn pending_commands(&self) -> impl Iterator<Item = &Command> {
        self.pending.values()
    }

    /// Append a confirmed turn to the log. The number must be exactly the
    /// next expected one; anything else is a fatal protocol violation and
    /// the caller must stop the engine. Ignored quietly when Stopped
    /// (turns already in flight during teardown).
    pub fn add_confirmed_turn(&mut self, turn: Turn) -> Result<(), LockstepError> {
        if !self.running {
            return Ok(());
        }
        if turn.number != self.next_confirmed {
            return Err(LockstepError::TurnOutOfOrder {
                expected: self.next_confirmed,
                got: turn.number,
            });
        }
        self.admit_turn(turn);
        Ok(())
    }

    /// Expand a run-length count into `count` synthetic empty turns with
    /// consecutive numbers continuing from the last confirmed one.
    /// Infallible by construction — the numbers are generated here.
    pub fn add_confirmed_empty_turns(&mut self, count: u32) {
        if !self.running {
            return;
        }
        for _ in 0..count {
            self.admit_turn(Turn::empty(self.next_confirmed));
        }
    }

    fn admit_turn(&mut self, turn: Turn) {
        self.next_confirmed = TurnNumber(self.next_confirmed.0 + 1);
        // Sealed own commands are no longer pending, and the id counter
        // must stay ahead of anything the server has already seen (a
        // resumed client learns its old ids from the backfill).
        for command in &turn.commands {
            if command.player == self.player {
                self.pending.remove(&command.id);
                if command.id.0 >= self.next_command_id {
                    self.next_command_id = command.id.0 + 1;
                }
            }
        }
        self.confirmed.push_back(turn);
        #[expect(clippy::cast_possible_truncation)]
        let depth = self.confirmed.len() as u32;
        self.stats.sample(depth);
    }

    /// Remove a pending command after the server rejected it. Returns the
    /// command so the integrator can surface it. Never retried here.
    pub fn fail_command(&mut self, id: CommandId) -> Option<Command> {
        self.pending.remove(&id)
    }

    /// Advance elapsed time and return the confirmed turns now due, in
    /// order. A turn is due once the clock passes the end of its interval.
    /// When the next turn is due but not yet confirmed, the stream stalls —
    /// the engine never skips ahead.
    pub fn update(&mut self, delta_ms: u32) -> Vec<Turn> {
        let mut due = Vec::new();
        if !self.running {
            return due;
        }
        self.time_ms += i64::from(delta_ms);
        while let Some(front) = self.confirmed.front() {
            let deadline =
                (i64::from(front.number.0) + 1) * i64::from(self.turn_duration_ms);
            if self.time_ms < deadline {
                break;
            }
            // Front of the queue is always next_consumed: admission is
            // strictly sequential.
            if let Some(turn) = self.confirmed.pop_front() {
                self.next_consumed = TurnNumber(turn.number.0 + 1);
                due.push(turn);
            }
        }
        due
    }

    /// Buffering statistics collected since construction.
    pub fn buffer_stats(&self) -> TurnBufferStats {
        self.stats
    }
}
