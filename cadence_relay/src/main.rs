// CLI entry point for the Cadence lockstep server.
//
// Starts a standalone match server that game clients connect to. The
// server orders commands into confirmed turns and broadcasts them — it
// never runs the simulation. See `server.rs` for the networking
// architecture and `session.rs` for the match state.
//
// Usage:
//   cadence-server [OPTIONS]
//     --port <PORT>                  Listen port (default: 7878)
//     --max-players <N>              Max players (default: 4)
//     --turn-ms <MS>                 Turn duration (default: 100)
//     --start-delay-ms <MS>          Client start delay (default: 1000)
//     --sim-delay-ms <MS>            First-seal grace period (default: 1000)
//     --end-timeout-secs <SECS>      Forced-end countdown (default: 30)
//     --finish-on-disconnect <BOOL>  End match when a player drops (default: true)
//     --allow-single-player <BOOL>   Start with one ready player (default: false)
//     --game-params <JSON>           Opaque params pushed to clients (default: null)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cadence_relay::server::{ServerConfig, start_server};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = parse_args();

    let (handle, addr) = match start_server(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    println!("Lockstep server listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // Park until killed. The process exits on SIGINT/SIGTERM by default,
    // which is fine for a standalone server.
    let running = Arc::new(AtomicBool::new(true));
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    handle.stop();
}

/// Parse command-line arguments into a `ServerConfig`. Uses simple
/// `std::env::args()` matching — no clap dependency.
fn parse_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--max-players" => {
                i += 1;
                config.lockstep.max_players =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--max-players requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--turn-ms" => {
                i += 1;
                config.lockstep.turn_duration_ms =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--turn-ms requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--start-delay-ms" => {
                i += 1;
                config.lockstep.client_start_delay_ms =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--start-delay-ms requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--sim-delay-ms" => {
                i += 1;
                config.lockstep.client_simulation_delay_ms =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--sim-delay-ms requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--end-timeout-secs" => {
                i += 1;
                config.lockstep.match_ended_without_confirmation_timeout_secs =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--end-timeout-secs requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--finish-on-disconnect" => {
                i += 1;
                config.lockstep.finish_on_client_disconnection =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--finish-on-disconnect requires true or false");
                        std::process::exit(1);
                    });
            }
            "--allow-single-player" => {
                i += 1;
                config.lockstep.allow_match_start_with_one_player_ready =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--allow-single-player requires true or false");
                        std::process::exit(1);
                    });
            }
            "--game-params" => {
                i += 1;
                config.game_params = args
                    .get(i)
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_else(|| {
                        eprintln!("--game-params requires a valid JSON value");
                        std::process::exit(1);
                    });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: cadence-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>                  Listen port (default: 7878)");
    println!("  --max-players <N>              Max players (default: 4)");
    println!("  --turn-ms <MS>                 Turn duration (default: 100)");
    println!("  --start-delay-ms <MS>          Client start delay (default: 1000)");
    println!("  --sim-delay-ms <MS>            First-seal grace period (default: 1000)");
    println!("  --end-timeout-secs <SECS>      Forced-end countdown (default: 30)");
    println!("  --finish-on-disconnect <BOOL>  End match when a player drops (default: true)");
    println!("  --allow-single-player <BOOL>   Start with one ready player (default: false)");
    println!("  --game-params <JSON>           Opaque params pushed to clients (default: null)");
    println!("  --help, -h                     Show this help");
}
