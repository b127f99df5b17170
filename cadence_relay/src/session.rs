// Match session state for the lockstep server.
//
// `MatchSession` is the central data structure that `server.rs` drives. It
// owns the server engine and tracks connections, player identities, match
// phase, finish bookkeeping, and checksum-based desync detection. All
// mutation happens through methods called from the server's
// single-threaded main loop — no internal locking.
//
// Two keys identify a participant:
// - `ClientId` tags one transport connection, handed out in `on_connect`
//   and dead after a disconnect.
// - `PlayerToken` is the durable identity carried in `PlayerReady`. The
//   token maps to a `PlayerNumber` on first ready and keeps it across
//   reconnects, so player numbers are assigned lowest-unused, never
//   reused, and therefore always contiguous from 0. A client finds itself
//   in the start roster by position.
//
// Writing to clients goes through the `MessageSink` trait: TCP
// connections use a `BufWriter` sink, in-process clients a channel sink.
// Write errors on a single client are logged but do not crash the server —
// the reader side of that client will notice the broken pipe and deliver
// a disconnect event.

use std::collections::BTreeMap;
use std::io::{self, BufWriter};
use std::net::TcpStream;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;

use cadence_lockstep::{LockstepError, ServerEngine, ServerEvent};
use cadence_protocol::config::LockstepConfig;
use cadence_protocol::framing::write_message;
use cadence_protocol::message::{ClientMessage, ServerMessage};
use cadence_protocol::turn::{Command, empty_turn_chunks};
use cadence_protocol::types::{ClientId, PlayerNumber, PlayerToken, TurnNumber};

use crate::clock::{LinkClock, wall_clock_ms};
use crate::metrics::RelayMetrics;

/// How often the session pings every connection to keep the link clock
/// estimates fresh.
const PING_INTERVAL_MS: u32 = 2_000;

/// Outbound half of one client connection.
pub trait MessageSink: Send {
    /// Serialize and deliver one message. Returns the bytes written, 0
    /// when the sink has no wire representation.
    fn send(&mut self, message: &ServerMessage) -> io::Result<usize>;
}

/// TCP sink over the write half of a client stream.
pub struct TcpSink {
    writer: BufWriter<TcpStream>,
}

impl TcpSink {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            writer: BufWriter::new(stream),
        }
    }
}

impl MessageSink for TcpSink {
    fn send(&mut self, message: &ServerMessage) -> io::Result<usize> {
        let json = serde_json::to_vec(message)?;
        write_message(&mut self.writer, &json)?;
        Ok(json.len() + 4)
    }
}

/// One live connection: its sink, clock estimates, and the player bound
/// to it after a successful ready.
struct ClientLink {
    sink: Box<dyn MessageSink>,
    clock: LinkClock,
    player: Option<PlayerNumber>,
}

/// Per-player record. Created on first `PlayerReady` for a token and
/// never removed, which is what keeps player numbers contiguous.
pub struct ClientData {
    pub token: PlayerToken,
    /// Currently bound connection, `None` while disconnected.
    pub client: Option<ClientId>,
    pub ready: bool,
    pub version: String,
    /// How many connections this token has bound; above 1 means the
    /// player has reconnected.
    pub connection_count: u32,
    /// Result submitted via `PlayerFinish`. First write wins.
    pub finished: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchPhase {
    Lobby,
    Running,
    Ended,
}

/// External matchmaking backend. When installed it supplies the
/// authoritative token-to-identity mapping for the start roster and takes
/// over result distribution at match end.
pub trait Matchmaker: Send {
    /// Display identity for a token. Tokens double as identities when the
    /// backend does not know one.
    fn identity_for(&self, token: &PlayerToken) -> Option<String>;

    /// Deliver the final results, keyed by identity. Clients get no
    /// individual end messages when this path is taken.
    fn submit_results(&mut self, results: &[(String, Value)]);
}

/// External authority on whether the match is really over when players
/// claim it is. Denial arms the forced-end countdown instead of ending
/// immediately.
pub trait MatchEndCheck: Send {
    fn confirm_end(&mut self, finished: usize, ready: usize, current_turn: TurnNumber) -> bool;
}

/// Session for one match: connections, players, engine, and phase.
pub struct MatchSession {
    config: LockstepConfig,
    game_params: Value,
    engine: ServerEngine,
    phase: MatchPhase,
    links: BTreeMap<ClientId, ClientLink>,
    players: BTreeMap<PlayerNumber, ClientData>,
    next_client_id: u64,
    /// Client version accepted for this match, set by the first ready.
    reference_version: Option<String>,
    /// Wall clock at match start, the anchor every start message derives
    /// from. Late joiners get the same anchor so their clocks land at the
    /// live frontier.
    match_start_wall_ms: i64,
    /// Remaining grace once players claim the match is over but the end
    /// check disagrees.
    end_countdown_ms: Option<i64>,
    matchmaker: Option<Box<dyn Matchmaker>>,
    end_check: Option<Box<dyn MatchEndCheck>>,
    checksums: BTreeMap<TurnNumber, BTreeMap<PlayerNumber, u64>>,
    metrics: Arc<RelayMetrics>,
    ping_elapsed_ms: u32,
}

impl MatchSession {
    pub fn new(config: LockstepConfig, game_params: Value, metrics: Arc<RelayMetrics>) -> Self {
        let engine = ServerEngine::new(config.turn_duration_ms);
        Self {
            config,
            game_params,
            engine,
            phase: MatchPhase::Lobby,
            links: BTreeMap::new(),
            players: BTreeMap::new(),
            next_client_id: 0,
            reference_version: None,
            match_start_wall_ms: 0,
            end_countdown_ms: None,
            matchmaker: None,
            end_check: None,
            checksums: BTreeMap::new(),
            metrics,
            ping_elapsed_ms: 0,
        }
    }

    pub fn set_matchmaker(&mut self, matchmaker: Box<dyn Matchmaker>) {
        self.matchmaker = Some(matchmaker);
    }

    pub fn set_end_check(&mut self, check: Box<dyn MatchEndCheck>) {
        self.end_check = Some(check);
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Players known to the match, connected or not.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    /// Register a new connection. Pushes the configuration immediately so
    /// the client can become ready, and a first clock probe.
    pub fn on_connect(&mut self, sink: Box<dyn MessageSink>) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.links.insert(
            id,
            ClientLink {
                sink,
                clock: LinkClock::default(),
                player: None,
            },
        );
        debug!("client {} connected", id.0);

        let setup = ServerMessage::ClientSetup {
            config: self.config.clone(),
            game_params: self.game_params.clone(),
        };
        self.send_to(id, &setup);
        let ping = ServerMessage::Ping {
            sent_ms: wall_clock_ms(),
        };
        self.send_to(id, &ping);
        id
    }

    /// Dispatch one message from a connection.
    pub fn handle_message(&mut self, client: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::Ping { sent_ms } => {
                let now = wall_clock_ms();
                if let Some(link) = self.links.get_mut(&client) {
                    link.clock.observe_peer_clock(sent_ms, now);
                }
                self.send_to(client, &ServerMessage::Pong { sent_ms });
            }
            ClientMessage::Pong { sent_ms } => {
                let now = wall_clock_ms();
                if let Some(link) = self.links.get_mut(&client) {
                    link.clock.observe_rtt(sent_ms, now);
                }
            }
            ClientMessage::PlayerReady {
                token,
                current_turn,
                version,
            } => {
                self.handle_player_ready(client, token, current_turn, version);
            }
            ClientMessage::Command { command } => {
                self.handle_command(client, command);
            }
            ClientMessage::PlayerFinish { result } => {
                self.handle_player_finish(client, result);
            }
            ClientMessage::Checksum { turn, hash } => {
                self.record_checksum(client, turn, hash);
            }
            ClientMessage::Goodbye => {
                // Normally intercepted by the reader loop; handle it here
                // too for transports that deliver it directly.
                self.on_disconnect(client);
            }
        }
    }

    fn handle_player_ready(
        &mut self,
        client: ClientId,
        token: PlayerToken,
        current_turn: TurnNumber,
        version: String,
    ) {
        if self.phase == MatchPhase::Ended {
            self.send_to(
                client,
                &ServerMessage::Rejected {
                    reason: "match already ended".into(),
                },
            );
            return;
        }

        // Version gate: the first ready sets the reference.
        if self
            .reference_version
            .as_ref()
            .is_some_and(|reference| *reference != version)
        {
            warn!("client {} rejected: version {version} mismatch", client.0);
            self.send_to(
                client,
                &ServerMessage::Rejected {
                    reason: "client version mismatch".into(),
                },
            );
            return;
        }
        if self.reference_version.is_none() {
            self.reference_version = Some(version.clone());
        }

        // Find the player for this token, or claim the lowest unused
        // number for a new one.
        let existing = self
            .players
            .iter()
            .find_map(|(number, data)| (data.token == token).then_some(*number));
        let number = match existing {
            Some(number) => number,
            None => {
                let Some(number) = self.lowest_unused_number() else {
                    self.send_to(
                        client,
                        &ServerMessage::Rejected {
                            reason: "match is full".into(),
                        },
                    );
                    return;
                };
                self.players.insert(
                    number,
                    ClientData {
                        token,
                        client: None,
                        ready: false,
                        version: version.clone(),
                        connection_count: 0,
                        finished: None,
                    },
                );
                number
            }
        };

        // Bind the connection. A reconnect replaces the old binding and
        // orphans the stale link so its eventual disconnect is inert.
        let mut announce = false;
        if let Some(data) = self.players.get_mut(&number) {
            let rebind = data.client != Some(client);
            if rebind {
                let old = data.client.replace(client);
                data.connection_count += 1;
                if let Some(link) = old.and_then(|old| self.links.get_mut(&old)) {
                    link.player = None;
                }
                announce = data.connection_count > 1 || self.phase == MatchPhase::Running;
            }
            data.ready = true;
            data.version = version;
        }
        if let Some(link) = self.links.get_mut(&client) {
            link.player = Some(number);
        }
        self.engine.set_player_ready(number, true);
        info!("player {} ready on client {}", number.0, client.0);

        if announce {
            let status = ServerMessage::ClientConnectionStatus {
                player: number,
                connected: true,
            };
            self.broadcast_to_ready(&status, Some(client));
        }

        match self.phase {
            MatchPhase::Running => {
                self.send_start_to(client);
                self.backfill(client, current_turn);
            }
            MatchPhase::Lobby => {
                let ready = self.players.values().filter(|p| p.ready).count();
                if ready >= usize::from(self.config.max_players)
                    || (ready > 0 && self.config.allow_match_start_with_one_player_ready)
                {
                    self.start_match();
                }
            }
            MatchPhase::Ended => {}
        }
    }

    fn lowest_unused_number(&self) -> Option<PlayerNumber> {
        if self.players.len() >= usize::from(self.config.max_players) {
            return None;
        }
        let mut candidate = 0u8;
        while self.players.contains_key(&PlayerNumber(candidate)) {
            candidate += 1;
        }
        Some(PlayerNumber(candidate))
    }

    fn start_match(&mut self) {
        self.phase = MatchPhase::Running;
        self.engine.start(self.config.client_simulation_delay_ms);
        self.match_start_wall_ms = wall_clock_ms();
        let targets: Vec<ClientId> = self
            .players
            .values()
            .filter(|data| data.ready)
            .filter_map(|data| data.client)
            .collect();
        info!("match started with {} ready players", targets.len());
        for client in targets {
            self.send_start_to(client);
        }
    }

    /// Send the start negotiation to one client: a server clock sample and
    /// the start-delay-adjusted start time, shifted toward the client by
    /// the link's one-way estimate. The client adds its own one-way
    /// estimate back when computing the true start.
    fn send_start_to(&mut self, client: ClientId) {
        let one_way = self
            .links
            .get(&client)
            .map_or(0, |link| link.clock.one_way_ms());
        let start_time_ms =
            self.match_start_wall_ms - i64::from(self.config.client_start_delay_ms) - one_way;
        let msg = ServerMessage::ClientStart {
            server_time_ms: wall_clock_ms(),
            start_time_ms,
            players: self.roster(),
        };
        self.send_to(client, &msg);
    }

    /// Identities in ascending player-number order. Position equals player
    /// number because numbers are contiguous.
    fn roster(&self) -> Vec<String> {
        self.players
            .values()
            .map(|data| {
                self.matchmaker
                    .as_ref()
                    .and_then(|m| m.identity_for(&data.token))
                    .unwrap_or_else(|| data.token.0.clone())
            })
            .collect()
    }

    /// Retransmit every sealed turn from `from` forward to one client, as
    /// discrete turns with empty runs re-encoded as counts.
    fn backfill(&mut self, client: ClientId, from: TurnNumber) {
        // Empties still pending in the engine go to the other clients
        // first; they are already in the history the newcomer gets, and
        // must not reach it a second time through the normal flush.
        let pending = self.engine.take_empty_run();
        if pending > 0 {
            self.broadcast_empty_run(pending, Some(client));
        }

        let mut messages = Vec::new();
        let mut empty_run = 0u32;
        for turn in self.engine.turns_from(from) {
            if turn.is_empty() {
                empty_run += 1;
            } else {
                for count in empty_turn_chunks(empty_run) {
                    messages.push(ServerMessage::EmptyTurns { count });
                }
                empty_run = 0;
                messages.push(ServerMessage::Turn { turn: turn.clone() });
            }
        }
        for count in empty_turn_chunks(empty_run) {
            messages.push(ServerMessage::EmptyTurns { count });
        }

        debug!(
            "backfilling client {} from turn {} ({} messages)",
            client.0,
            from.0,
            messages.len()
        );
        for message in &messages {
            self.send_to(client, message);
        }
    }

    fn handle_command(&mut self, client: ClientId, mut command: Command) {
        if self.phase != MatchPhase::Running {
            self.reject_command(client, command, &LockstepError::MatchNotRunning);
            return;
        }
        // The server-known binding wins; a connection cannot attribute
        // input to another player.
        let Some(player) = self.links.get(&client).and_then(|link| link.player) else {
            let err = LockstepError::PlayerNotReady {
                player: command.player,
            };
            self.reject_command(client, command, &err);
            return;
        };
        command.player = player;
        if let Err(err) = self.engine.add_command(command.clone()) {
            warn!(
                "rejected command {} from player {}: {err}",
                command.id.0, player.0
            );
            self.reject_command(client, command, &err);
        }
    }

    fn reject_command(&mut self, client: ClientId, command: Command, err: &LockstepError) {
        self.metrics.record_command_rejected();
        let msg = ServerMessage::CommandFailed {
            player: command.player,
            command: command.id,
            code: err.code(),
            reason: err.to_string(),
        };
        self.send_to(client, &msg);
    }

    fn handle_player_finish(&mut self, client: ClientId, result: Value) {
        if self.phase != MatchPhase::Running {
            return;
        }
        let Some(player) = self.links.get(&client).and_then(|link| link.player) else {
            return;
        };
        let Some(data) = self.players.get_mut(&player) else {
            return;
        };
        if data.finished.is_some() {
            debug!("player {} finished again, keeping first result", player.0);
            return;
        }
        data.finished = Some(result);
        info!("player {} finished", player.0);
        self.try_finish_match();
    }

    /// Re-evaluate the end condition: every ready player has finished. An
    /// installed end check can veto, which arms the forced-end countdown
    /// instead.
    fn try_finish_match(&mut self) {
        if self.phase != MatchPhase::Running {
            return;
        }
        let ready = self.players.values().filter(|p| p.ready).count();
        let finished = self.players.values().filter(|p| p.finished.is_some()).count();
        if finished == 0 || finished < ready {
            return;
        }
        let confirmed = match self.end_check.as_mut() {
            Some(check) => check.confirm_end(finished, ready, self.engine.next_turn()),
            None => true,
        };
        if confirmed {
            self.end_match();
        } else if self.end_countdown_ms.is_none() {
            let timeout_secs = self.config.match_ended_without_confirmation_timeout_secs;
            warn!("player tried to end the match early, forcing end in {timeout_secs}s");
            self.end_countdown_ms = Some(i64::from(timeout_secs) * 1_000);
        }
    }

    fn end_match(&mut self) {
        if self.phase == MatchPhase::Ended {
            return;
        }
        self.phase = MatchPhase::Ended;
        self.end_countdown_ms = None;
        self.engine.stop();
        info!("match ended at turn {}", self.engine.next_turn().0);

        if let Some(matchmaker) = self.matchmaker.as_mut() {
            let results: Vec<(String, Value)> = self
                .players
                .values()
                .filter_map(|data| {
                    let result = data.finished.clone()?;
                    let identity = matchmaker
                        .identity_for(&data.token)
                        .unwrap_or_else(|| data.token.0.clone());
                    Some((identity, result))
                })
                .collect();
            matchmaker.submit_results(&results);
        } else {
            // Each still-connected client gets its own result; Null for a
            // player that never submitted one.
            let deliveries: Vec<(ClientId, Value)> = self
                .players
                .values()
                .filter_map(|data| {
                    let client = data.client?;
                    Some((client, data.finished.clone().unwrap_or(Value::Null)))
                })
                .collect();
            for (client, result) in deliveries {
                self.send_to(client, &ServerMessage::ClientEnd { result });
            }
        }
    }

    /// Handle a connection going away, from either a reader error or a
    /// graceful goodbye.
    pub fn on_disconnect(&mut self, client: ClientId) {
        let Some(link) = self.links.remove(&client) else {
            return;
        };
        self.metrics.record_disconnect();
        let Some(player) = link.player else {
            debug!("client {} disconnected before ready", client.0);
            return;
        };
        let was_bound = match self.players.get_mut(&player) {
            Some(data) if data.client == Some(client) => {
                data.client = None;
                data.ready = false;
                true
            }
            _ => false,
        };
        if !was_bound {
            return;
        }
        self.engine.set_player_ready(player, false);
        for turn_checksums in self.checksums.values_mut() {
            turn_checksums.remove(&player);
        }
        info!("player {} disconnected", player.0);
        let status = ServerMessage::ClientConnectionStatus {
            player,
            connected: false,
        };
        self.broadcast_to_ready(&status, None);
        if self.phase == MatchPhase::Running && self.config.finish_on_client_disconnection {
            self.try_finish_match();
        }
    }

    /// Record a state checksum. Once every ready player has reported for a
    /// turn, disagreement broadcasts `DesyncDetected` and reports at or
    /// below that turn are dropped.
    fn record_checksum(&mut self, client: ClientId, turn: TurnNumber, hash: u64) {
        let Some(player) = self.links.get(&client).and_then(|link| link.player) else {
            return;
        };
        let reporters = self.players.values().filter(|p| p.ready).count();
        let entry = self.checksums.entry(turn).or_default();
        entry.insert(player, hash);
        if entry.len() < reporters || reporters < 2 {
            return;
        }
        let mut values = entry.values();
        let first = values.next().copied().unwrap_or(0);
        let all_match = values.all(|v| *v == first);
        if !all_match {
            warn!("desync detected at turn {}", turn.0);
            let msg = ServerMessage::DesyncDetected { turn };
            self.broadcast_to_ready(&msg, None);
        }
        let stale: Vec<TurnNumber> = self
            .checksums
            .keys()
            .filter(|t| **t <= turn)
            .copied()
            .collect();
        for t in stale {
            self.checksums.remove(&t);
        }
    }

    /// Advance the match by one scheduler interval: seal due turns and
    /// broadcast them, run the forced-end countdown, refresh clock probes.
    pub fn tick(&mut self, delta_ms: u32) {
        let events = self.engine.update(delta_ms);
        for event in events {
            match event {
                ServerEvent::TurnReady(turn) => {
                    self.metrics.record_turn_broadcast();
                    let msg = ServerMessage::Turn { turn };
                    self.broadcast_to_ready(&msg, None);
                }
                ServerEvent::EmptyTurnsReady(count) => {
                    self.broadcast_empty_run(count, None);
                }
            }
        }

        if let Some(remaining) = self.end_countdown_ms {
            let remaining = remaining - i64::from(delta_ms);
            if remaining <= 0 {
                warn!("forcing match end after confirmation timeout");
                self.end_match();
            } else {
                self.end_countdown_ms = Some(remaining);
            }
        }

        self.ping_elapsed_ms += delta_ms;
        if self.ping_elapsed_ms >= PING_INTERVAL_MS {
            self.ping_elapsed_ms = 0;
            let ping = ServerMessage::Ping {
                sent_ms: wall_clock_ms(),
            };
            let targets: Vec<ClientId> = self.links.keys().copied().collect();
            for client in targets {
                self.send_to(client, &ping);
            }
        }
    }

    fn broadcast_empty_run(&mut self, count: u32, exclude: Option<ClientId>) {
        self.metrics.record_empty_batch();
        for chunk in empty_turn_chunks(count) {
            let msg = ServerMessage::EmptyTurns { count: chunk };
            self.broadcast_to_ready(&msg, exclude);
        }
    }

    /// Send to every ready player's connection, minus `exclude`. Turn
    /// traffic never goes to connections that have not completed a ready
    /// handshake.
    fn broadcast_to_ready(&mut self, msg: &ServerMessage, exclude: Option<ClientId>) {
        let targets: Vec<ClientId> = self
            .players
            .values()
            .filter(|data| data.ready)
            .filter_map(|data| data.client)
            .filter(|client| Some(*client) != exclude)
            .collect();
        for client in targets {
            self.send_to(client, msg);
        }
    }

    /// Send a message to one connection. Write errors are dropped here;
    /// the reader side of a broken pipe delivers the disconnect.
    fn send_to(&mut self, client: ClientId, msg: &ServerMessage) {
        if let Some(link) = self.links.get_mut(&client) {
            if let Ok(bytes) = link.sink.send(msg) {
                self.metrics.record_sent(bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    use cadence_protocol::framing::read_message;
    use cadence_protocol::types::CommandId;
    use serde_json::json;

    use super::*;

    fn test_config() -> LockstepConfig {
        LockstepConfig {
            max_players: 2,
            turn_duration_ms: 100,
            client_start_delay_ms: 1_000,
            client_simulation_delay_ms: 0,
            match_ended_without_confirmation_timeout_secs: 1,
            finish_on_client_disconnection: false,
            allow_match_start_with_one_player_ready: false,
        }
    }

    fn session_with(config: LockstepConfig) -> MatchSession {
        MatchSession::new(
            config,
            json!({"map": "test"}),
            Arc::new(RelayMetrics::default()),
        )
    }

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// Connect a TCP-backed client and return its id plus the read half.
    fn connect(session: &mut MatchSession) -> (ClientId, BufReader<TcpStream>) {
        let (client, server) = tcp_pair();
        let id = session.on_connect(Box::new(TcpSink::new(server)));
        (id, BufReader::new(client))
    }

    fn recv_msg(reader: &mut BufReader<TcpStream>) -> ServerMessage {
        let bytes = read_message(reader).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Drain the `ClientSetup` and initial `Ping` every connection gets.
    fn drain_handshake(reader: &mut BufReader<TcpStream>) {
        let setup = recv_msg(reader);
        assert!(matches!(setup, ServerMessage::ClientSetup { .. }));
        let ping = recv_msg(reader);
        assert!(matches!(ping, ServerMessage::Ping { .. }));
    }

    fn ready(session: &mut MatchSession, client: ClientId, token: &str, current_turn: u32) {
        session.handle_message(
            client,
            ClientMessage::PlayerReady {
                token: PlayerToken::new(token),
                current_turn: TurnNumber(current_turn),
                version: "1.0".into(),
            },
        );
    }

    fn command(id: u32, player: u8, payload: Vec<u8>) -> ClientMessage {
        ClientMessage::Command {
            command: Command {
                id: CommandId(id),
                player: PlayerNumber(player),
                payload,
            },
        }
    }

    /// Two connected clients, both ready, match running. Returns
    /// (session, a, reader_a, b, reader_b) with handshakes and start
    /// messages drained.
    fn running_pair() -> (
        MatchSession,
        ClientId,
        BufReader<TcpStream>,
        ClientId,
        BufReader<TcpStream>,
    ) {
        let mut session = session_with(test_config());
        let (a, mut reader_a) = connect(&mut session);
        let (b, mut reader_b) = connect(&mut session);
        ready(&mut session, a, "alice", 0);
        ready(&mut session, b, "bob", 0);
        drain_handshake(&mut reader_a);
        drain_handshake(&mut reader_b);
        let start_a = recv_msg(&mut reader_a);
        assert!(matches!(start_a, ServerMessage::ClientStart { .. }));
        let start_b = recv_msg(&mut reader_b);
        assert!(matches!(start_b, ServerMessage::ClientStart { .. }));
        (session, a, reader_a, b, reader_b)
    }

    #[test]
    fn connect_sends_setup_then_ping() {
        let mut session = session_with(test_config());
        let (_, mut reader) = connect(&mut session);

        match recv_msg(&mut reader) {
            ServerMessage::ClientSetup {
                config,
                game_params,
            } => {
                assert_eq!(config, test_config());
                assert_eq!(game_params, json!({"map": "test"}));
            }
            other => panic!("expected ClientSetup, got {other:?}"),
        }
        assert!(matches!(recv_msg(&mut reader), ServerMessage::Ping { .. }));
    }

    #[test]
    fn two_ready_players_start_match() {
        let mut session = session_with(test_config());
        let (a, mut reader_a) = connect(&mut session);
        let (b, mut reader_b) = connect(&mut session);

        ready(&mut session, a, "alice", 0);
        assert_eq!(session.phase(), MatchPhase::Lobby);

        ready(&mut session, b, "bob", 0);
        assert_eq!(session.phase(), MatchPhase::Running);

        drain_handshake(&mut reader_a);
        match recv_msg(&mut reader_a) {
            ServerMessage::ClientStart {
                server_time_ms,
                start_time_ms,
                players,
            } => {
                // Roster in ascending player-number order; alice readied
                // first so she is number 0.
                assert_eq!(players, vec!["alice".to_string(), "bob".to_string()]);
                // No rtt samples yet, so the adjustment is exactly the
                // start delay (modulo the clock advancing between start
                // and send).
                let diff = server_time_ms - start_time_ms;
                assert!((1_000..1_100).contains(&diff), "diff was {diff}");
            }
            other => panic!("expected ClientStart, got {other:?}"),
        }

        drain_handshake(&mut reader_b);
        assert!(matches!(
            recv_msg(&mut reader_b),
            ServerMessage::ClientStart { .. }
        ));
    }

    #[test]
    fn single_ready_player_starts_when_allowed() {
        let mut config = test_config();
        config.allow_match_start_with_one_player_ready = true;
        let mut session = session_with(config);
        let (a, mut reader_a) = connect(&mut session);

        ready(&mut session, a, "alice", 0);
        assert_eq!(session.phase(), MatchPhase::Running);

        drain_handshake(&mut reader_a);
        match recv_msg(&mut reader_a) {
            ServerMessage::ClientStart { players, .. } => {
                assert_eq!(players, vec!["alice".to_string()]);
            }
            other => panic!("expected ClientStart, got {other:?}"),
        }
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut session = session_with(test_config());
        let (a, _reader_a) = connect(&mut session);
        let (b, mut reader_b) = connect(&mut session);

        ready(&mut session, a, "alice", 0);
        session.handle_message(
            b,
            ClientMessage::PlayerReady {
                token: PlayerToken::new("bob"),
                current_turn: TurnNumber(0),
                version: "2.0".into(),
            },
        );

        drain_handshake(&mut reader_b);
        match recv_msg(&mut reader_b) {
            ServerMessage::Rejected { reason } => {
                assert_eq!(reason, "client version mismatch");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(session.player_count(), 1);
    }

    #[test]
    fn extra_player_rejected_when_full() {
        let mut config = test_config();
        config.max_players = 1;
        config.allow_match_start_with_one_player_ready = true;
        let mut session = session_with(config);
        let (a, _reader_a) = connect(&mut session);
        ready(&mut session, a, "alice", 0);

        let (b, mut reader_b) = connect(&mut session);
        ready(&mut session, b, "bob", 0);

        drain_handshake(&mut reader_b);
        match recv_msg(&mut reader_b) {
            ServerMessage::Rejected { reason } => {
                assert_eq!(reason, "match is full");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn command_attributed_to_bound_player() {
        let (mut session, a, mut reader_a, _b, mut reader_b) = running_pair();

        // Claimed player number 7 is overwritten with the binding.
        session.handle_message(a, command(1, 7, vec![1, 2, 3]));
        session.tick(100);

        for reader in [&mut reader_a, &mut reader_b] {
            match recv_msg(reader) {
                ServerMessage::Turn { turn } => {
                    assert_eq!(turn.number, TurnNumber(0));
                    assert_eq!(turn.commands.len(), 1);
                    assert_eq!(turn.commands[0].player, PlayerNumber(0));
                    assert_eq!(turn.commands[0].id, CommandId(1));
                    assert_eq!(turn.commands[0].payload, vec![1, 2, 3]);
                }
                other => panic!("expected Turn, got {other:?}"),
            }
        }
    }

    #[test]
    fn command_from_unbound_client_fails() {
        let (mut session, _a, _reader_a, _b, _reader_b) = running_pair();
        let (c, mut reader_c) = connect(&mut session);

        session.handle_message(c, command(5, 9, vec![0]));

        drain_handshake(&mut reader_c);
        match recv_msg(&mut reader_c) {
            ServerMessage::CommandFailed {
                player,
                command,
                code,
                ..
            } => {
                assert_eq!(player, PlayerNumber(9));
                assert_eq!(command, CommandId(5));
                assert_eq!(code, 2);
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn command_before_start_fails() {
        let mut session = session_with(test_config());
        let (a, mut reader_a) = connect(&mut session);
        ready(&mut session, a, "alice", 0);

        session.handle_message(a, command(1, 0, vec![0]));

        drain_handshake(&mut reader_a);
        match recv_msg(&mut reader_a) {
            ServerMessage::CommandFailed { code, reason, .. } => {
                assert_eq!(code, 4);
                assert_eq!(reason, "match is not running");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_command_fails() {
        let (mut session, a, mut reader_a, _b, _reader_b) = running_pair();

        session.handle_message(a, command(1, 0, vec![1]));
        session.handle_message(a, command(1, 0, vec![1]));

        match recv_msg(&mut reader_a) {
            ServerMessage::CommandFailed { command, code, .. } => {
                assert_eq!(command, CommandId(1));
                assert_eq!(code, 3);
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }

        // The first submission still seals normally.
        session.tick(100);
        match recv_msg(&mut reader_a) {
            ServerMessage::Turn { turn } => assert_eq!(turn.commands.len(), 1),
            other => panic!("expected Turn, got {other:?}"),
        }
    }

    #[test]
    fn empty_turns_batch_into_one_message() {
        let (mut session, _a, mut reader_a, _b, _reader_b) = running_pair();

        session.tick(1_000);

        match recv_msg(&mut reader_a) {
            ServerMessage::EmptyTurns { count } => assert_eq!(count, 10),
            other => panic!("expected EmptyTurns, got {other:?}"),
        }
    }

    #[test]
    fn finish_delivers_each_client_its_own_result() {
        let (mut session, a, mut reader_a, b, mut reader_b) = running_pair();

        session.handle_message(a, ClientMessage::PlayerFinish { result: json!("A") });
        assert_eq!(session.phase(), MatchPhase::Running);
        session.handle_message(b, ClientMessage::PlayerFinish { result: json!("B") });
        assert_eq!(session.phase(), MatchPhase::Ended);

        match recv_msg(&mut reader_a) {
            ServerMessage::ClientEnd { result } => assert_eq!(result, json!("A")),
            other => panic!("expected ClientEnd, got {other:?}"),
        }
        match recv_msg(&mut reader_b) {
            ServerMessage::ClientEnd { result } => assert_eq!(result, json!("B")),
            other => panic!("expected ClientEnd, got {other:?}"),
        }
    }

    #[test]
    fn repeat_finish_keeps_first_result() {
        let (mut session, a, mut reader_a, b, _reader_b) = running_pair();

        session.handle_message(a, ClientMessage::PlayerFinish { result: json!("first") });
        session.handle_message(a, ClientMessage::PlayerFinish { result: json!("second") });
        session.handle_message(b, ClientMessage::PlayerFinish { result: json!("B") });

        match recv_msg(&mut reader_a) {
            ServerMessage::ClientEnd { result } => assert_eq!(result, json!("first")),
            other => panic!("expected ClientEnd, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_with_finish_flag_ends_match() {
        let mut config = test_config();
        config.finish_on_client_disconnection = true;
        let mut session = session_with(config);
        let (a, mut reader_a) = connect(&mut session);
        let (b, _reader_b) = connect(&mut session);
        ready(&mut session, a, "alice", 0);
        ready(&mut session, b, "bob", 0);
        drain_handshake(&mut reader_a);
        assert!(matches!(
            recv_msg(&mut reader_a),
            ServerMessage::ClientStart { .. }
        ));

        session.handle_message(a, ClientMessage::PlayerFinish { result: json!("A") });
        assert_eq!(session.phase(), MatchPhase::Running);

        // The disconnect excludes bob from the ready count; alice's finish
        // now covers everyone.
        session.on_disconnect(b);
        assert_eq!(session.phase(), MatchPhase::Ended);

        match recv_msg(&mut reader_a) {
            ServerMessage::ClientConnectionStatus { player, connected } => {
                assert_eq!(player, PlayerNumber(1));
                assert!(!connected);
            }
            other => panic!("expected ClientConnectionStatus, got {other:?}"),
        }
        match recv_msg(&mut reader_a) {
            ServerMessage::ClientEnd { result } => assert_eq!(result, json!("A")),
            other => panic!("expected ClientEnd, got {other:?}"),
        }
    }

    #[test]
    fn reconnect_keeps_player_number_and_backfills() {
        let (mut session, a, mut reader_a, b, mut reader_b) = running_pair();

        session.handle_message(a, command(1, 0, vec![1]));
        session.tick(100);
        assert!(matches!(recv_msg(&mut reader_a), ServerMessage::Turn { .. }));
        assert!(matches!(recv_msg(&mut reader_b), ServerMessage::Turn { .. }));

        session.on_disconnect(b);
        match recv_msg(&mut reader_a) {
            ServerMessage::ClientConnectionStatus { player, connected } => {
                assert_eq!(player, PlayerNumber(1));
                assert!(!connected);
            }
            other => panic!("expected ClientConnectionStatus, got {other:?}"),
        }

        // A turn sealed while bob is away.
        session.handle_message(a, command(2, 0, vec![2]));
        session.tick(100);
        assert!(matches!(recv_msg(&mut reader_a), ServerMessage::Turn { .. }));

        // Bob returns on a fresh connection, resuming from turn 1.
        let (b2, mut reader_b2) = connect(&mut session);
        ready(&mut session, b2, "bob", 1);
        assert_eq!(session.player_count(), 2);

        match recv_msg(&mut reader_a) {
            ServerMessage::ClientConnectionStatus { player, connected } => {
                assert_eq!(player, PlayerNumber(1));
                assert!(connected);
            }
            other => panic!("expected ClientConnectionStatus, got {other:?}"),
        }

        drain_handshake(&mut reader_b2);
        match recv_msg(&mut reader_b2) {
            ServerMessage::ClientStart { players, .. } => {
                // Same number: same roster position.
                assert_eq!(players, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("expected ClientStart, got {other:?}"),
        }
        match recv_msg(&mut reader_b2) {
            ServerMessage::Turn { turn } => {
                assert_eq!(turn.number, TurnNumber(1));
                assert_eq!(turn.commands[0].payload, vec![2]);
            }
            other => panic!("expected Turn, got {other:?}"),
        }
    }

    #[test]
    fn late_joiner_backfilled_to_frontier() {
        let mut config = test_config();
        config.allow_match_start_with_one_player_ready = true;
        let mut session = session_with(config);
        let (a, mut reader_a) = connect(&mut session);
        ready(&mut session, a, "alice", 0);
        drain_handshake(&mut reader_a);
        assert!(matches!(
            recv_msg(&mut reader_a),
            ServerMessage::ClientStart { .. }
        ));

        // Turn 0 has a command, turns 1..=3 are empty and still pending in
        // the engine's run counter when bob joins.
        session.handle_message(a, command(1, 0, vec![9]));
        session.tick(100);
        assert!(matches!(recv_msg(&mut reader_a), ServerMessage::Turn { .. }));
        session.tick(300);

        let (b, mut reader_b) = connect(&mut session);
        ready(&mut session, b, "bob", 0);

        // Alice gets the pending empties flushed ahead of the backfill,
        // after the connect notice.
        match recv_msg(&mut reader_a) {
            ServerMessage::ClientConnectionStatus { player, connected } => {
                assert_eq!(player, PlayerNumber(1));
                assert!(connected);
            }
            other => panic!("expected ClientConnectionStatus, got {other:?}"),
        }
        match recv_msg(&mut reader_a) {
            ServerMessage::EmptyTurns { count } => assert_eq!(count, 3),
            other => panic!("expected EmptyTurns, got {other:?}"),
        }

        // Bob gets the whole history re-encoded, gapless.
        drain_handshake(&mut reader_b);
        assert!(matches!(
            recv_msg(&mut reader_b),
            ServerMessage::ClientStart { .. }
        ));
        match recv_msg(&mut reader_b) {
            ServerMessage::Turn { turn } => assert_eq!(turn.number, TurnNumber(0)),
            other => panic!("expected Turn, got {other:?}"),
        }
        match recv_msg(&mut reader_b) {
            ServerMessage::EmptyTurns { count } => assert_eq!(count, 3),
            other => panic!("expected EmptyTurns, got {other:?}"),
        }

        // The next sealed turn reaches both without duplication.
        session.handle_message(a, command(2, 0, vec![7]));
        session.tick(100);
        for reader in [&mut reader_a, &mut reader_b] {
            match recv_msg(reader) {
                ServerMessage::Turn { turn } => assert_eq!(turn.number, TurnNumber(4)),
                other => panic!("expected Turn, got {other:?}"),
            }
        }
    }

    #[test]
    fn checksum_mismatch_broadcasts_desync() {
        let (mut session, a, mut reader_a, b, mut reader_b) = running_pair();

        session.handle_message(a, ClientMessage::Checksum { turn: TurnNumber(2), hash: 7 });
        session.handle_message(b, ClientMessage::Checksum { turn: TurnNumber(2), hash: 8 });

        for reader in [&mut reader_a, &mut reader_b] {
            match recv_msg(reader) {
                ServerMessage::DesyncDetected { turn } => assert_eq!(turn, TurnNumber(2)),
                other => panic!("expected DesyncDetected, got {other:?}"),
            }
        }
    }

    #[test]
    fn matching_checksums_stay_silent() {
        let (mut session, a, mut reader_a, b, _reader_b) = running_pair();

        session.handle_message(a, ClientMessage::Checksum { turn: TurnNumber(1), hash: 7 });
        session.handle_message(b, ClientMessage::Checksum { turn: TurnNumber(1), hash: 7 });

        // A later mismatch is the next thing alice hears, proving the
        // matching round produced nothing.
        session.handle_message(a, ClientMessage::Checksum { turn: TurnNumber(5), hash: 1 });
        session.handle_message(b, ClientMessage::Checksum { turn: TurnNumber(5), hash: 2 });
        match recv_msg(&mut reader_a) {
            ServerMessage::DesyncDetected { turn } => assert_eq!(turn, TurnNumber(5)),
            other => panic!("expected DesyncDetected, got {other:?}"),
        }
    }

    struct StubMatchmaker {
        results: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl Matchmaker for StubMatchmaker {
        fn identity_for(&self, token: &PlayerToken) -> Option<String> {
            Some(format!("id-{}", token.0))
        }

        fn submit_results(&mut self, results: &[(String, Value)]) {
            self.results.lock().unwrap().extend_from_slice(results);
        }
    }

    #[test]
    fn matchmaker_supplies_roster_and_takes_results() {
        let mut session = session_with(test_config());
        let results = Arc::new(Mutex::new(Vec::new()));
        session.set_matchmaker(Box::new(StubMatchmaker {
            results: results.clone(),
        }));

        let (a, mut reader_a) = connect(&mut session);
        let (b, _reader_b) = connect(&mut session);
        ready(&mut session, a, "alice", 0);
        ready(&mut session, b, "bob", 0);

        drain_handshake(&mut reader_a);
        match recv_msg(&mut reader_a) {
            ServerMessage::ClientStart { players, .. } => {
                assert_eq!(players, vec!["id-alice".to_string(), "id-bob".to_string()]);
            }
            other => panic!("expected ClientStart, got {other:?}"),
        }

        session.handle_message(a, ClientMessage::PlayerFinish { result: json!(10) });
        session.handle_message(b, ClientMessage::PlayerFinish { result: json!(20) });
        assert_eq!(session.phase(), MatchPhase::Ended);

        let submitted = results.lock().unwrap();
        assert_eq!(
            *submitted,
            vec![
                ("id-alice".to_string(), json!(10)),
                ("id-bob".to_string(), json!(20)),
            ]
        );
    }

    struct DenyEndCheck;

    impl MatchEndCheck for DenyEndCheck {
        fn confirm_end(&mut self, _finished: usize, _ready: usize, _turn: TurnNumber) -> bool {
            false
        }
    }

    #[test]
    fn denied_end_forces_after_timeout() {
        let mut session = session_with(test_config());
        session.set_end_check(Box::new(DenyEndCheck));
        let (a, mut reader_a) = connect(&mut session);
        let (b, _reader_b) = connect(&mut session);
        ready(&mut session, a, "alice", 0);
        ready(&mut session, b, "bob", 0);
        drain_handshake(&mut reader_a);
        assert!(matches!(
            recv_msg(&mut reader_a),
            ServerMessage::ClientStart { .. }
        ));

        session.handle_message(a, ClientMessage::PlayerFinish { result: json!("A") });
        session.handle_message(b, ClientMessage::PlayerFinish { result: json!("B") });
        assert_eq!(session.phase(), MatchPhase::Running);

        // Timeout is 1s; the match keeps sealing until it expires.
        session.tick(500);
        assert_eq!(session.phase(), MatchPhase::Running);
        session.tick(500);
        assert_eq!(session.phase(), MatchPhase::Ended);

        match recv_msg(&mut reader_a) {
            ServerMessage::EmptyTurns { count } => assert_eq!(count, 10),
            other => panic!("expected EmptyTurns, got {other:?}"),
        }
        match recv_msg(&mut reader_a) {
            ServerMessage::ClientEnd { result } => assert_eq!(result, json!("A")),
            other => panic!("expected ClientEnd, got {other:?}"),
        }
    }

    #[test]
    fn ready_after_end_rejected() {
        let mut config = test_config();
        config.max_players = 1;
        config.allow_match_start_with_one_player_ready = true;
        let mut session = session_with(config);
        let (a, _reader_a) = connect(&mut session);
        ready(&mut session, a, "alice", 0);
        session.handle_message(a, ClientMessage::PlayerFinish { result: json!("A") });
        assert_eq!(session.phase(), MatchPhase::Ended);

        let (b, mut reader_b) = connect(&mut session);
        ready(&mut session, b, "bob", 0);
        drain_handshake(&mut reader_b);
        match recv_msg(&mut reader_b) {
            ServerMessage::Rejected { reason } => {
                assert_eq!(reason, "match already ended");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn client_ping_echoed_as_pong() {
        let mut session = session_with(test_config());
        let (a, mut reader_a) = connect(&mut session);
        drain_handshake(&mut reader_a);

        session.handle_message(a, ClientMessage::Ping { sent_ms: 777 });
        match recv_msg(&mut reader_a) {
            ServerMessage::Pong { sent_ms } => assert_eq!(sent_ms, 777),
            other => panic!("expected Pong, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_before_ready_is_quiet() {
        let (mut session, _a, mut reader_a, _b, _reader_b) = running_pair();
        let (c, _reader_c) = connect(&mut session);

        session.on_disconnect(c);
        assert_eq!(session.player_count(), 2);

        // No status notice reaches the players for an unbound connection;
        // the next thing alice hears is ordinary turn traffic.
        session.tick(1_000);
        match recv_msg(&mut reader_a) {
            ServerMessage::EmptyTurns { count } => assert_eq!(count, 10),
            other => panic!("expected EmptyTurns, got {other:?}"),
        }
    }
}
