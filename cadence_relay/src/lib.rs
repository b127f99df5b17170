// cadence_relay — lockstep match server and client integration.
//
// This crate implements both halves of the synchronization protocol
// defined in `cadence_protocol`. The server is a thin authority: it
// accepts TCP connections from game clients, collects commands, seals
// them into numbered turns at a fixed cadence, and broadcasts each
// confirmed turn to every ready client. It never runs the simulation —
// all game logic stays on the clients, which consume identical turn
// streams through `cadence_lockstep` engines.
//
// Module overview:
// - `session.rs`:  Match state — player roster keyed by durable tokens,
//                  readiness and start negotiation, backfill for late
//                  joiners, finish/result collection, checksum-based
//                  desync detection. The core structure `server.rs`
//                  drives.
// - `server.rs`:   TCP listener, reader threads (one per client), and
//                  the main event loop. `std::net` with a
//                  thread-per-reader architecture and an `mpsc` channel
//                  funneling events into the single-threaded session.
// - `client.rs`:   `SyncClient`, the game-facing integration layer, and
//                  the TCP transport behind it.
// - `local.rs`:    In-process transport so a host can embed the server
//                  and join its own match without a socket.
// - `clock.rs`:    RTT and clock-offset estimation for start-time
//                  negotiation.
// - `metrics.rs`:  Traffic and turn counters exposed by the server
//                  handle.
// - `error.rs`:    Transport-level error type with stable codes.
//
// Dependencies: `cadence_protocol` (shared message types and framing)
// and `cadence_lockstep` (the deterministic turn engines). No game
// logic.
//
// The server can run as a standalone binary (`main.rs`) or be embedded
// in a game process via the library API (`start_server`).

pub mod client;
pub mod clock;
pub mod error;
pub mod local;
pub mod metrics;
pub mod server;
pub mod session;

pub use client::SyncClient;
pub use server::start_server;
