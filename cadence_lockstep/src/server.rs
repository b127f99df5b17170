// Server-side lockstep engine.
//
// Collects commands from ready players, seals them into an authoritative
// turn once per turn interval, and reports sealed turns as returned
// events. Runs of empty turns are batched into a single run-length event
// so an idle match costs almost nothing on the wire.
//
// The engine owns the rules that make the turn stream identical on every
// peer: commands inside a sealed turn are sorted by (player, id), turn
// numbers are gapless from 0, and duplicate command ids are rejected at
// admission. Transport and player lifecycle live in `cadence_relay`.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use cadence_protocol::turn::{Command, Turn};
use cadence_protocol::types::{CommandId, PlayerNumber, TurnNumber};

use crate::error::LockstepError;

/// Empty-turn runs are flushed once this many accumulate, so a long idle
/// stretch still produces periodic traffic instead of one giant batch at
/// the end.
pub const EMPTY_TURN_BATCH: u32 = 10;

/// Sealed-turn events produced by [`ServerEngine::update`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// A turn carrying at least one command.
    TurnReady(Turn),
    /// A run of consecutive turns with no commands, as a count.
    EmptyTurnsReady(u32),
}

/// Server-side engine: command collection and turn sealing.
pub struct ServerEngine {
    turn_duration_ms: u32,
    running: bool,
    /// Elapsed simulation time in ms. Starts negative by the simulation
    /// delay so clients accumulate a turn buffer before their clocks
    /// catch up.
    time_ms: i64,
    /// Commands admitted but not yet sealed, in arrival order.
    pending: Vec<Command>,
    ready: BTreeSet<PlayerNumber>,
    /// Every (player, id) pair ever admitted, for duplicate rejection.
    seen_ids: FxHashSet<(PlayerNumber, CommandId)>,
    /// All sealed turns since `start`, indexable by turn number.
    turns: Vec<Turn>,
    next_turn: TurnNumber,
    /// Empty turns sealed but not yet reported.
    empty_run: u32,
}

impl ServerEngine {
    pub fn new(turn_duration_ms: u32) -> Self {
        Self {
            turn_duration_ms,
            running: false,
            time_ms: 0,
            pending: Vec::new(),
            ready: BTreeSet::new(),
            seen_ids: FxHashSet::default(),
            turns: Vec::new(),
            next_turn: TurnNumber(0),
            empty_run: 0,
        }
    }

    /// Begin a match. The clock starts at `-simulation_delay_ms`, so the
    /// first seal lands one full turn duration plus the delay after this
    /// call and clients get a head start on buffering.
    pub fn start(&mut self, simulation_delay_ms: u32) {
        self.running = true;
        self.time_ms = -i64::from(simulation_delay_ms);
        self.pending.clear();
        self.seen_ids.clear();
        self.turns.clear();
        self.next_turn = TurnNumber(0);
        self.empty_run = 0;
    }

    /// Stop sealing. The turn history is kept so results and reconnect
    /// backfills can still read it.
    pub fn stop(&mut self) {
        self.running = false;
        self.pending.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number the next sealed turn will carry.
    pub fn next_turn(&self) -> TurnNumber {
        self.next_turn
    }

    pub fn set_player_ready(&mut self, player: PlayerNumber, ready: bool) {
        if ready {
            self.ready.insert(player);
        } else {
            self.ready.remove(&player);
        }
    }

    pub fn is_player_ready(&self, player: PlayerNumber) -> bool {
        self.ready.contains(&player)
    }

    /// Admit a command into the next turn. Rejections are per-command and
    /// final; the stream is unaffected. Quietly dropped when not Running
    /// (commands in flight during teardown).
    pub fn add_command(&mut self, command: Command) -> Result<(), LockstepError> {
        if !self.running {
            return Ok(());
        }
        if !self.ready.contains(&command.player) {
            return Err(LockstepError::PlayerNotReady {
                player: command.player,
            });
        }
        if !self.seen_ids.insert((command.player, command.id)) {
            return Err(LockstepError::DuplicateCommand {
                player: command.player,
                id: command.id,
            });
        }
        self.pending.push(command);
        Ok(())
    }

    /// Advance the clock and seal every turn whose interval has elapsed.
    /// Sealed turns with commands are returned as [`ServerEvent::TurnReady`];
    /// empty turns accumulate into runs and flush as
    /// [`ServerEvent::EmptyTurnsReady`] when a non-empty turn interrupts the
    /// run or the run reaches [`EMPTY_TURN_BATCH`].
    pub fn update(&mut self, delta_ms: u32) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if !self.running {
            return events;
        }
        self.time_ms += i64::from(delta_ms);
        while self.time_ms
            >= (i64::from(self.next_turn.0) + 1) * i64::from(self.turn_duration_ms)
        {
            self.seal_turn(&mut events);
        }
        events
    }

    fn seal_turn(&mut self, events: &mut Vec<ServerEvent>) {
        let number = self.next_turn;
        self.next_turn = TurnNumber(number.0 + 1);

        if self.pending.is_empty() {
            self.turns.push(Turn::empty(number));
            self.empty_run += 1;
            if self.empty_run >= EMPTY_TURN_BATCH {
                events.push(ServerEvent::EmptyTurnsReady(self.empty_run));
                self.empty_run = 0;
            }
            return;
        }

        let mut commands = std::mem::take(&mut self.pending);
        // Canonical order, so every peer applies the same sequence no
        // matter how arrival interleaved.
        commands.sort_by_key(|c| (c.player, c.id));
        let turn = Turn { number, commands };

        if self.empty_run > 0 {
            events.push(ServerEvent::EmptyTurnsReady(self.empty_run));
            self.empty_run = 0;
        }
        events.push(ServerEvent::TurnReady(turn.clone()));
        self.turns.push(turn);
    }

    /// Take the unflushed empty-turn run, if any. Used before a reconnect
    /// backfill: pending empties must reach the existing clients first or
    /// the backfilled client would see them twice.
    pub fn take_empty_run(&mut self) -> u32 {
        std::mem::take(&mut self.empty_run)
    }

    /// All sealed turns from `from` onward, in order. Sealing is gapless
    /// from 0, so the turn number doubles as the history index.
    pub fn turns_from(&self, from: TurnNumber) -> impl Iterator<Item = &Turn> {
        self.turns.iter().skip(from.0 as usize)
    }
}
