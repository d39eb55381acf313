// CLI entry point for a standalone rally host.
//
// Opens a hosting endpoint over TCP under this install's persistent
// identity and drives the session loop, logging what happens. Joiners reach
// it by dialing the printed address with the printed room id as the remote
// id. Useful for exercising clients without running a game process.
//
// Usage:
//   rally-host [OPTIONS]
//     --port <PORT>         Listen port (default: 7878)
//     --identity <PATH>     Identity file (default: rally-identity.json)
//     --store <DIR>         Known-joiner directory (default: rally-joiners)
//     --config <PATH>       JSON `SyncConfig` (default: built-in values)
//     --start               Start the match immediately
//
// Logging goes through `env_logger`; set `RUST_LOG` to change the level.
// Ctrl+C closes the room with `hostLeft`, so joiners end their sessions
// instead of retrying.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{error, info};
use rally_session::{
    FileIdentityStore, JsonFileJoinerStore, Node, SessionEvent, SyncConfig, TcpTransport,
};

/// Parsed command line.
struct Args {
    port: u16,
    identity: PathBuf,
    store: PathBuf,
    config: Option<PathBuf>,
    start: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: 7878,
            identity: PathBuf::from("rally-identity.json"),
            store: PathBuf::from("rally-joiners"),
            config: None,
            start: false,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args();

    let config = match &args.config {
        Some(path) => SyncConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Failed to load config {}: {e}", path.display());
            std::process::exit(1);
        }),
        None => SyncConfig::default(),
    };
    let poll_interval = config.tick_interval() / 4;

    let mut identity = FileIdentityStore::new(&args.identity);
    let joiners = JsonFileJoinerStore::new(&args.store);
    let mut node = match Node::new(TcpTransport::new(args.port), &mut identity, joiners, config) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Failed to initialize: {e}");
            std::process::exit(1);
        }
    };

    let room = match node.become_host(Instant::now()) {
        Ok(room) => room,
        Err(e) => {
            eprintln!("Failed to start hosting: {e}");
            std::process::exit(1);
        }
    };
    let addr = node.host().and_then(|h| h.endpoint().local_addr());
    match addr {
        Some(addr) => println!("Hosting room {room} on {addr}"),
        None => println!("Hosting room {room}"),
    }

    if args.start {
        if let Err(e) = node.start_game() {
            error!("could not start the match: {e}");
        }
    }

    println!("Press Ctrl+C to stop.");

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    if let Err(e) = ctrlc::set_handler(move || running_handler.store(false, Ordering::SeqCst)) {
        error!("could not install the Ctrl+C handler: {e}");
    }

    while running.load(Ordering::SeqCst) {
        node.pump(Instant::now());
        for event in node.poll_events() {
            log_event(&event);
        }
        std::thread::sleep(poll_interval);
    }

    println!("\nShutting down...");
    node.leave(Instant::now());
    for event in node.poll_events() {
        log_event(&event);
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::JoinerJoined { id, color, .. } => info!("{id} joined as {color}"),
        SessionEvent::JoinerReconnected { old, new, color } => {
            info!("{old} reconnected as {new}, keeping {color}");
        }
        SessionEvent::JoinerLeft { id } => info!("{id} left"),
        SessionEvent::EnemyKilled {
            enemy_id,
            killer,
            experience,
        } => match killer {
            Some(killer) => info!("{enemy_id} killed by {killer} for {experience} xp"),
            None => info!("{enemy_id} killed for {experience} xp"),
        },
        SessionEvent::ProtocolError { from, reason } => {
            info!("dropped message from {from}: {reason}");
        }
        other => info!("{other:?}"),
    }
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching.
fn parse_args() -> Args {
    let mut parsed = Args::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                parsed.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--identity" => {
                i += 1;
                parsed.identity = args.get(i).map(PathBuf::from).unwrap_or_else(|| {
                    eprintln!("--identity requires a path");
                    std::process::exit(1);
                });
            }
            "--store" => {
                i += 1;
                parsed.store = args.get(i).map(PathBuf::from).unwrap_or_else(|| {
                    eprintln!("--store requires a directory");
                    std::process::exit(1);
                });
            }
            "--config" => {
                i += 1;
                parsed.config = args.get(i).map(PathBuf::from).or_else(|| {
                    eprintln!("--config requires a path");
                    std::process::exit(1);
                });
            }
            "--start" => parsed.start = true,
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

    parsed
}

fn print_usage() {
    println!("Usage: rally-host [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>         Listen port (default: 7878)");
    println!("  --identity <PATH>     Identity file (default: rally-identity.json)");
    println!("  --store <DIR>         Known-joiner directory (default: rally-joiners)");
    println!("  --config <PATH>       JSON session config (default: built-in values)");
    println!("  --start               Start the match immediately");
    println!("  --help, -h            Show this help");
}
