// Test-only game peer for lockstep integration tests.
//
// Wraps a real `SyncClient` (from `cadence_relay::client`) to provide a
// synchronous, test-friendly API for exercising the full pipeline:
// connect → ready → start → command → confirmed turn → finish → result.
//
// The only test-specific code here is the synchronous polling wrappers
// (blocking loops around `SyncClient::update()`). All networking and
// turn handling uses the same code paths as a real game client.
//
// See also: `tests/full_match.rs` for the integration scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use cadence_protocol::turn::Turn;
use cadence_protocol::types::{PlayerNumber, PlayerToken, TurnNumber};
use cadence_relay::client::{ClientEvent, ClientTransport, SyncClient, TcpTransport};
use cadence_relay::local::LocalTransport;

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Protocol version all test peers report.
const TEST_VERSION: &str = "test-1";

/// A test game peer wrapping a real SyncClient.
pub struct TestPeer {
    pub client: SyncClient,
    pub started: Option<(PlayerNumber, Vec<String>)>,
    pub turns: Vec<Turn>,
    pub result: Option<Value>,
    pub peers: Vec<(PlayerNumber, bool)>,
    pub desyncs: Vec<TurnNumber>,
    pub errors: Vec<(u32, String)>,
    last_update: Instant,
}

impl TestPeer {
    /// Connect over TCP and request readiness. Blocks until the server's
    /// setup message arrived, so the ready request is on the wire when
    /// this returns.
    pub fn connect(addr: SocketAddr, token: &str) -> Self {
        let transport =
            TcpTransport::connect(&addr.to_string()).expect("TestPeer::connect failed");
        Self::with_transport(Box::new(transport), token)
    }

    /// Same as `connect` but over an in-process transport from
    /// `ServerHandle::register_local_client`.
    pub fn local(transport: LocalTransport, token: &str) -> Self {
        Self::with_transport(Box::new(transport), token)
    }

    fn with_transport(transport: Box<dyn ClientTransport>, token: &str) -> Self {
        let mut client = SyncClient::new(transport, PlayerToken::new(token), TEST_VERSION);
        client.request_ready().expect("request_ready failed");
        let mut peer = Self {
            client,
            started: None,
            turns: Vec::new(),
            result: None,
            peers: Vec::new(),
            desyncs: Vec::new(),
            errors: Vec::new(),
            last_update: Instant::now(),
        };

        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for setup"
            );
            peer.pump();
            if peer.client.config().is_some() {
                return peer;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drain the client once, advancing its clock by real elapsed time
    /// and folding events into the public fields.
    pub fn pump(&mut self) {
        let elapsed = self.last_update.elapsed();
        self.last_update = Instant::now();
        #[expect(clippy::cast_possible_truncation)]
        let delta_ms = elapsed.as_millis() as u32;

        for event in self.client.update(delta_ms) {
            match event {
                ClientEvent::Started { player, players } => {
                    self.started = Some((player, players));
                }
                ClientEvent::Turn(turn) => self.turns.push(turn),
                ClientEvent::Ended { result } => self.result = Some(result),
                ClientEvent::PeerConnection { player, connected } => {
                    self.peers.push((player, connected));
                }
                ClientEvent::DesyncDetected { turn } => self.desyncs.push(turn),
                ClientEvent::Error { code, message } => self.errors.push((code, message)),
                ClientEvent::CommandFailed {
                    command,
                    code,
                    reason,
                } => {
                    panic!("unexpected command failure: {command:?} code {code}: {reason}");
                }
            }
        }
    }

    /// Blocking poll until the match starts. Returns this peer's player
    /// number and the roster.
    pub fn wait_started(&mut self) -> (PlayerNumber, Vec<String>) {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for match start"
            );
            self.pump();
            if let Some(started) = self.started.clone() {
                return started;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until a turn numbered at least `number` has been
    /// consumed.
    pub fn wait_turns_through(&mut self, number: u32) {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for turn {number}"
            );
            self.pump();
            if self.turns.last().is_some_and(|t| t.number.0 >= number) {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until a consumed turn carries a command with this
    /// payload. Returns that turn.
    pub fn wait_turn_containing(&mut self, payload: &[u8]) -> Turn {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for command turn"
            );
            self.pump();
            let found = self
                .turns
                .iter()
                .find(|t| t.commands.iter().any(|c| c.payload == payload));
            if let Some(turn) = found {
                return turn.clone();
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until the match ends. Returns this peer's result.
    pub fn wait_ended(&mut self) -> Value {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for match end"
            );
            self.pump();
            if let Some(result) = self.result.clone() {
                return result;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Send a command payload to the server.
    pub fn send_command(&mut self, payload: &[u8]) {
        let id = self
            .client
            .send_command(payload.to_vec())
            .expect("send_command failed");
        assert!(id.is_some(), "send_command before match start");
    }

    pub fn send_finish(&mut self, result: Value) {
        self.client.send_finish(result).expect("send_finish failed");
    }

    pub fn send_checksum(&mut self, turn: u32, hash: u64) {
        self.client
            .send_checksum(TurnNumber(turn), hash)
            .expect("send_checksum failed");
    }

    /// Send Goodbye and close the connection.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}
