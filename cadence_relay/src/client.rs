// Client side of the lockstep protocol.
//
// Two layers live here:
//
// - `TcpTransport`: non-blocking TCP access for the main thread.
//   `connect()` opens the stream and spawns a background reader thread;
//   the reader deserializes `ServerMessage`s into an `mpsc` channel and
//   `poll()` drains it without blocking. The main thread holds a
//   `BufWriter<TcpStream>` for sending. Local clients substitute
//   `LocalTransport` behind the same trait.
//
// - `SyncClient`: drives a `ClientEngine` from the transport. It buffers
//   the ready request until the server's `ClientSetup` has arrived,
//   negotiates the start time from the server's clock samples, feeds
//   confirmed turns into the engine, and surfaces everything the game
//   layer cares about as returned `ClientEvent`s from `update()`.
//
// Fatal conditions (rejection, transport loss, an out-of-order turn)
// stop the engine and mark the client dead rather than continue from an
// inconsistent state; the game layer sees a single `Error` event.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use serde_json::Value;

use cadence_lockstep::{ClientEngine, LockstepError, TurnBufferStats};
use cadence_protocol::config::LockstepConfig;
use cadence_protocol::framing::{read_message, write_message};
use cadence_protocol::message::{ClientMessage, ServerMessage};
use cadence_protocol::turn::Turn;
use cadence_protocol::types::{CommandId, PlayerNumber, PlayerToken, TurnNumber};

use crate::clock::{LinkClock, wall_clock_ms};
use crate::error::SyncError;

/// Transport from a client to the server.
pub trait ClientTransport: Send {
    fn send(&mut self, message: &ClientMessage) -> Result<(), SyncError>;

    /// Drain all queued server messages without blocking.
    fn poll(&mut self) -> Result<Vec<ServerMessage>, SyncError>;
}

/// TCP client transport.
pub struct TcpTransport {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ServerMessage>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Connect to a server and spawn the reader thread. The server pushes
    /// `ClientSetup` on its own; there is no handshake to wait for.
    pub fn connect(addr: &str) -> Result<Self, SyncError> {
        let stream = TcpStream::connect(addr).map_err(|source| SyncError::Connect {
            addr: addr.into(),
            source,
        })?;
        let reader_stream = stream.try_clone()?;
        let writer = BufWriter::new(stream);

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(BufReader::new(reader_stream), tx);
        });

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }
}

impl ClientTransport for TcpTransport {
    fn send(&mut self, message: &ClientMessage) -> Result<(), SyncError> {
        let json = serde_json::to_vec(message)?;
        write_message(&mut self.writer, &json)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<ServerMessage>, SyncError> {
        let mut messages = Vec::new();
        loop {
            match self.inbox.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if messages.is_empty() {
                        return Err(SyncError::TransportClosed);
                    }
                    break;
                }
            }
        }
        Ok(messages)
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<ServerMessage>) {
    while let Ok(bytes) = read_message(&mut reader) {
        match serde_json::from_slice::<ServerMessage>(&bytes) {
            Ok(message) => {
                if tx.send(message).is_err() {
                    break; // Main thread dropped the receiver
                }
            }
            Err(_) => break, // Malformed message
        }
    }
}

/// Events returned by [`SyncClient::update`] for the game layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// The match started; this client is `player` in the given roster.
    Started {
        player: PlayerNumber,
        players: Vec<String>,
    },
    /// A confirmed turn is due for application.
    Turn(Turn),
    /// The server rejected a previously sent command. Not retried.
    CommandFailed {
        command: CommandId,
        code: u32,
        reason: String,
    },
    /// A peer's connection came up or went down.
    PeerConnection {
        player: PlayerNumber,
        connected: bool,
    },
    /// The match ended with this player's final result.
    Ended { result: Value },
    /// The server saw checksum disagreement at a turn.
    DesyncDetected { turn: TurnNumber },
    /// Fatal error; the engine has been stopped.
    Error { code: u32, message: String },
}

/// Client-side synchronization layer: one engine, one transport, one
/// match.
pub struct SyncClient {
    transport: Box<dyn ClientTransport>,
    token: PlayerToken,
    /// String this client looks for in the start roster to find its
    /// player number. The token unless a matchmaking backend maps
    /// identities.
    identity: String,
    version: String,
    config: Option<LockstepConfig>,
    game_params: Value,
    engine: Option<ClientEngine>,
    ready_requested: bool,
    ready_sent: bool,
    resume_turn: TurnNumber,
    clock: LinkClock,
    ended: bool,
    dead: bool,
}

impl SyncClient {
    pub fn new(
        transport: Box<dyn ClientTransport>,
        token: PlayerToken,
        version: impl Into<String>,
    ) -> Self {
        let identity = token.0.clone();
        Self {
            transport,
            token,
            identity,
            version: version.into(),
            config: None,
            game_params: Value::Null,
            engine: None,
            ready_requested: false,
            ready_sent: false,
            resume_turn: TurnNumber(0),
            clock: LinkClock::default(),
            ended: false,
            dead: false,
        }
    }

    /// Resume point for a rejoin: both the ready message and the engine
    /// pick up from this turn.
    pub fn with_resume_turn(mut self, turn: TurnNumber) -> Self {
        self.resume_turn = turn;
        self
    }

    /// Identity to locate in the start roster, for deployments where a
    /// matchmaking backend maps tokens to display identities.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Configuration pushed by the server, once `ClientSetup` arrived.
    pub fn config(&self) -> Option<&LockstepConfig> {
        self.config.as_ref()
    }

    pub fn game_params(&self) -> &Value {
        &self.game_params
    }

    /// This client's player number, known once the match started.
    pub fn player(&self) -> Option<PlayerNumber> {
        self.engine.as_ref().map(ClientEngine::player)
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Turn to resume from if this client reconnects with a fresh
    /// `SyncClient`.
    pub fn resume_turn(&self) -> TurnNumber {
        self.engine
            .as_ref()
            .map_or(self.resume_turn, ClientEngine::next_confirmed_turn)
    }

    pub fn buffer_stats(&self) -> Option<TurnBufferStats> {
        self.engine.as_ref().map(ClientEngine::buffer_stats)
    }

    /// Ask to enter the match. Buffered until `ClientSetup` arrives,
    /// since readiness before configuration is meaningless. Idempotent.
    pub fn request_ready(&mut self) -> Result<(), SyncError> {
        self.ready_requested = true;
        if self.config.is_some() && !self.ready_sent {
            self.transmit_ready()?;
        }
        Ok(())
    }

    fn transmit_ready(&mut self) -> Result<(), SyncError> {
        let current_turn = self
            .engine
            .as_ref()
            .map_or(self.resume_turn, ClientEngine::next_confirmed_turn);
        let msg = ClientMessage::PlayerReady {
            token: self.token.clone(),
            current_turn,
            version: self.version.clone(),
        };
        self.transport.send(&msg)?;
        self.ready_sent = true;
        Ok(())
    }

    /// Queue a command and transmit it. Returns the assigned id, `None`
    /// while no match is running.
    pub fn send_command(&mut self, payload: Vec<u8>) -> Result<Option<CommandId>, SyncError> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(None);
        };
        let Some(id) = engine.add_command(payload) else {
            return Ok(None);
        };
        let outgoing = engine.take_outgoing();
        for command in outgoing {
            self.transport.send(&ClientMessage::Command { command })?;
        }
        Ok(Some(id))
    }

    /// Submit this player's final result.
    pub fn send_finish(&mut self, result: Value) -> Result<(), SyncError> {
        self.transport.send(&ClientMessage::PlayerFinish { result })
    }

    /// Report a state hash for desync detection.
    pub fn send_checksum(&mut self, turn: TurnNumber, hash: u64) -> Result<(), SyncError> {
        self.transport.send(&ClientMessage::Checksum { turn, hash })
    }

    /// Leave gracefully and stop the engine.
    pub fn disconnect(&mut self) {
        let _ = self.transport.send(&ClientMessage::Goodbye);
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.dead = true;
    }

    /// Drain the transport, advance the engine clock, and return
    /// everything that happened.
    pub fn update(&mut self, delta_ms: u32) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if self.dead {
            return events;
        }

        match self.transport.poll() {
            Ok(messages) => {
                for message in messages {
                    self.handle_server_message(message, &mut events);
                }
            }
            Err(err) => {
                self.fail(&err, &mut events);
                return events;
            }
        }

        if let Some(engine) = self.engine.as_mut() {
            for turn in engine.update(delta_ms) {
                events.push(ClientEvent::Turn(turn));
            }
        }
        events
    }

    fn handle_server_message(&mut self, message: ServerMessage, events: &mut Vec<ClientEvent>) {
        if self.dead {
            return;
        }
        match message {
            ServerMessage::Ping { sent_ms } => {
                self.clock.observe_peer_clock(sent_ms, wall_clock_ms());
                if let Err(err) = self.transport.send(&ClientMessage::Pong { sent_ms }) {
                    self.fail(&err, events);
                }
            }
            ServerMessage::Pong { sent_ms } => {
                self.clock.observe_rtt(sent_ms, wall_clock_ms());
            }
            ServerMessage::ClientSetup {
                config,
                game_params,
            } => {
                self.config = Some(config);
                self.game_params = game_params;
                if self.ready_requested && !self.ready_sent {
                    if let Err(err) = self.transmit_ready() {
                        self.fail(&err, events);
                    }
                }
            }
            ServerMessage::ClientStart {
                server_time_ms,
                start_time_ms,
                players,
            } => {
                self.handle_start(server_time_ms, start_time_ms, players, events);
            }
            ServerMessage::Turn { turn } => {
                let outcome = match self.engine.as_mut() {
                    Some(engine) => engine.add_confirmed_turn(turn),
                    None => Ok(()),
                };
                if let Err(err) = outcome {
                    self.fail_engine(&err, events);
                }
            }
            ServerMessage::EmptyTurns { count } => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.add_confirmed_empty_turns(u32::from(count));
                }
            }
            ServerMessage::CommandFailed {
                command,
                code,
                reason,
                ..
            } => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.fail_command(command);
                }
                events.push(ClientEvent::CommandFailed {
                    command,
                    code,
                    reason,
                });
            }
            ServerMessage::ClientEnd { result } => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.stop();
                }
                self.ended = true;
                events.push(ClientEvent::Ended { result });
            }
            ServerMessage::ClientConnectionStatus { player, connected } => {
                events.push(ClientEvent::PeerConnection { player, connected });
            }
            ServerMessage::Rejected { reason } => {
                self.fail(&SyncError::Rejected(reason), events);
            }
            ServerMessage::DesyncDetected { turn } => {
                events.push(ClientEvent::DesyncDetected { turn });
            }
        }
    }

    fn handle_start(
        &mut self,
        server_time_ms: i64,
        start_time_ms: i64,
        players: Vec<String>,
        events: &mut Vec<ClientEvent>,
    ) {
        let Some(config) = self.config.as_ref() else {
            self.fail(&SyncError::Protocol("start before setup".into()), events);
            return;
        };
        let turn_duration_ms = config.turn_duration_ms;
        let Some(index) = players.iter().position(|p| *p == self.identity) else {
            self.fail(
                &SyncError::Protocol(format!(
                    "identity {} missing from roster",
                    self.identity
                )),
                events,
            );
            return;
        };
        #[expect(clippy::cast_possible_truncation)]
        let player = PlayerNumber(index as u8);

        // The server shifted the start time toward us by its one-way
        // estimate; adding ours back gives the true start, and elapsed
        // time falls out against the echoed server clock.
        let one_way = self.clock.one_way_ms();
        let true_start_ms = start_time_ms + one_way;
        let elapsed_ms = (server_time_ms + one_way) - true_start_ms;

        if self.engine.is_none() {
            self.engine = Some(ClientEngine::new(turn_duration_ms, player, self.resume_turn));
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.start(elapsed_ms);
        }
        events.push(ClientEvent::Started { player, players });
    }

    fn fail(&mut self, err: &SyncError, events: &mut Vec<ClientEvent>) {
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.dead = true;
        events.push(ClientEvent::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }

    fn fail_engine(&mut self, err: &LockstepError, events: &mut Vec<ClientEvent>) {
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.dead = true;
        events.push(ClientEvent::Error {
            code: err.code(),
            message: err.to_string(),
        });
    }
}
