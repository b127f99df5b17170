// TCP server and main event loop for the lockstep coordinator.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main
//   thread.
// - **Reader threads** (one per client): call `framing::read_message()` in
//   a loop, deserialize `ClientMessage`, and send
//   `InternalEvent::MessageFrom` to the main thread. On error/EOF, send
//   `InternalEvent::Disconnected`.
// - **Main thread**: owns the `MatchSession`, receives events from the
//   channel, and dispatches them. `recv_timeout` is capped at the time
//   remaining in the current turn interval, so the session ticks on the
//   turn cadence whether or not traffic is flowing.
//
// The main thread is the only writer to client connections (via the
// session's sinks). Reader threads only read. This avoids concurrent
// read/write on the same `TcpStream`, which is safe on most platforms but
// fragile.
//
// In-process clients (`ServerHandle::register_local_client`) skip TCP
// entirely: their messages arrive through the same channel and their
// outbound traffic goes through a channel sink, so the session cannot
// tell them apart from remote clients.
//
// Shutdown: the main thread checks a `keep_running` flag (set to false by
// `ServerHandle::stop`) and breaks out of the event loop.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde_json::Value;

use cadence_protocol::config::LockstepConfig;
use cadence_protocol::framing::read_message;
use cadence_protocol::message::{ClientMessage, ServerMessage};
use cadence_protocol::types::ClientId;

use crate::error::SyncError;
use crate::local::{ChannelSink, LocalTransport};
use crate::metrics::{MetricsSnapshot, RelayMetrics};
use crate::session::{MatchEndCheck, MatchSession, Matchmaker, TcpSink};

/// Events sent from listener/reader threads to the main thread.
pub(crate) enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    NewLocalClient {
        outbox: Sender<ServerMessage>,
        ack: Sender<ClientId>,
    },
    MessageFrom {
        client: ClientId,
        message: ClientMessage,
    },
    Disconnected {
        client: ClientId,
    },
}

/// Configuration for starting a match server.
pub struct ServerConfig {
    pub port: u16,
    pub lockstep: LockstepConfig,
    pub game_params: Value,
    pub matchmaker: Option<Box<dyn Matchmaker>>,
    pub end_check: Option<Box<dyn MatchEndCheck>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7878,
            lockstep: LockstepConfig::default(),
            game_params: Value::Null,
            matchmaker: None,
            end_check: None,
        }
    }
}

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    events: Sender<InternalEvent>,
    metrics: Arc<RelayMetrics>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal the server to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register an in-process client. Its commands enter the same queue as
    /// remote traffic and it receives the same message stream, directly in
    /// memory.
    pub fn register_local_client(&self) -> Result<LocalTransport, SyncError> {
        let (outbox_tx, outbox_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        self.events
            .send(InternalEvent::NewLocalClient {
                outbox: outbox_tx,
                ack: ack_tx,
            })
            .map_err(|_| SyncError::TransportClosed)?;
        let client = ack_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| SyncError::HandshakeTimeout)?;
        Ok(LocalTransport::new(client, self.events.clone(), outbox_rx))
    }
}

/// Start the match server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_server(config: ServerConfig) -> io::Result<(ServerHandle, SocketAddr)> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", config.port))?;
    let addr = listener.local_addr()?;
    info!("server listening on {addr}");
    let keep_running = Arc::new(AtomicBool::new(true));
    let metrics = Arc::new(RelayMetrics::default());
    let (tx, rx) = mpsc::channel();

    let keep_running_thread = keep_running.clone();
    let metrics_thread = metrics.clone();
    let tx_thread = tx.clone();
    let thread = thread::spawn(move || {
        run_server(
            listener,
            config,
            keep_running_thread,
            tx_thread,
            rx,
            metrics_thread,
        );
    });

    Ok((
        ServerHandle {
            keep_running,
            events: tx,
            metrics,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main server loop. Runs until `keep_running` is set to false.
fn run_server(
    listener: TcpListener,
    config: ServerConfig,
    keep_running: Arc<AtomicBool>,
    tx: Sender<InternalEvent>,
    rx: Receiver<InternalEvent>,
    metrics: Arc<RelayMetrics>,
) {
    let turn_duration = Duration::from_millis(u64::from(config.lockstep.turn_duration_ms));
    let ServerConfig {
        lockstep,
        game_params,
        matchmaker,
        end_check,
        ..
    } = config;
    let mut session = MatchSession::new(lockstep, game_params, metrics.clone());
    if let Some(matchmaker) = matchmaker {
        session.set_matchmaker(matchmaker);
    }
    if let Some(check) = end_check {
        session.set_end_check(check);
    }

    // Set the listener to non-blocking so the accept thread can check
    // keep_running periodically.
    listener.set_nonblocking(true).ok();

    // Listener thread: accepts new connections.
    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });

    // Main event loop: drain events, tick the session on the turn cadence.
    let mut last_tick = Instant::now();
    while keep_running.load(Ordering::SeqCst) {
        let timeout = turn_duration.saturating_sub(last_tick.elapsed());
        match rx.recv_timeout(timeout) {
            Ok(event) => {
                handle_event(&mut session, event, &tx, &keep_running, &metrics);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut session, event, &tx, &keep_running, &metrics);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let elapsed = last_tick.elapsed();
        if elapsed >= turn_duration {
            #[expect(clippy::cast_possible_truncation)]
            let delta_ms = elapsed.as_millis() as u32;
            session.tick(delta_ms);
            last_tick = Instant::now();
        }
    }
}

/// Dispatch a single event to the session.
fn handle_event(
    session: &mut MatchSession,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
    metrics: &Arc<RelayMetrics>,
) {
    match event {
        InternalEvent::NewConnection { stream } => {
            handle_new_connection(session, stream, tx, keep_running, metrics);
        }
        InternalEvent::NewLocalClient { outbox, ack } => {
            let client = session.on_connect(Box::new(ChannelSink::new(outbox)));
            let _ = ack.send(client);
        }
        InternalEvent::MessageFrom { client, message } => {
            session.handle_message(client, message);
        }
        InternalEvent::Disconnected { client } => {
            session.on_disconnect(client);
        }
    }
}

/// Handle a new TCP connection: register it with the session (which
/// pushes `ClientSetup` immediately) and spawn a reader thread.
fn handle_new_connection(
    session: &mut MatchSession,
    stream: TcpStream,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
    metrics: &Arc<RelayMetrics>,
) {
    // The session keeps the write half; the reader thread gets a clone.
    let reader = match stream.try_clone() {
        Ok(read_half) => BufReader::new(read_half),
        Err(err) => {
            warn!("dropping connection, stream clone failed: {err}");
            return;
        }
    };
    let client = session.on_connect(Box::new(TcpSink::new(stream)));

    let tx_reader = tx.clone();
    let keep_running_reader = keep_running.clone();
    let metrics_reader = metrics.clone();
    thread::spawn(move || {
        reader_loop(reader, client, tx_reader, keep_running_reader, metrics_reader);
    });
}

/// Reader loop for a single client. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    client: ClientId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
    metrics: Arc<RelayMetrics>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_message(&mut reader) {
            Ok(bytes) => {
                metrics.record_received(bytes.len() + 4);
                match serde_json::from_slice::<ClientMessage>(&bytes) {
                    Ok(ClientMessage::Goodbye) => {
                        let _ = tx.send(InternalEvent::Disconnected { client });
                        break;
                    }
                    Ok(message) => {
                        let _ = tx.send(InternalEvent::MessageFrom { client, message });
                    }
                    Err(_) => {
                        // Malformed message — disconnect.
                        let _ = tx.send(InternalEvent::Disconnected { client });
                        break;
                    }
                }
            }
            Err(_) => {
                // Read error or EOF — disconnect.
                let _ = tx.send(InternalEvent::Disconnected { client });
                break;
            }
        }
    }
}
