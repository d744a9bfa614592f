use clap::Parser;
use config::Config;
use relaychat::config::{seed_groups, seed_users};
use relaychat::{spawn_signal_listener, MemoryStore, Server, ServerSettings};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the relaychat crate based on verbosity level.
///
/// Without `-v`, output is controlled by `RUST_LOG` alone.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => {
            let Ok(filter) = EnvFilter::try_from_default_env() else {
                return; // No tracing
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
            return;
        }
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("relaychat={level},relaychat_server={level}");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Multi-client TLS chat relay", long_about = None)]
struct Args {
    /// Address to bind the server to (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

fn load_config(args: &Args) -> Result<Config, config::ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::with_name(path));
    }
    builder = builder.add_source(config::Environment::with_prefix("RELAYCHAT"));
    if let Some(bind) = &args.bind {
        builder = builder.set_override("bind", bind.as_str())?;
    }
    builder.build()
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let settings = match ServerSettings::from_config(&config) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let store = match (seed_users(&config, ""), seed_groups(&config, "")) {
        (Ok(users), Ok(groups)) => MemoryStore::with_seed(users, groups),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("Invalid user or group seed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let bind = settings.bind.clone();
    let server = match Server::bind(settings, Arc::new(store)) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Failed to start server on {bind}: {err}");
            return ExitCode::FAILURE;
        }
    };
    println!("Listening on {}", server.local_addr());

    let signal_thread = match spawn_signal_listener(server.shutdown_handle()) {
        Ok(t) => t,
        Err(err) => {
            eprintln!("Failed to install signal handlers: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = server.run() {
        eprintln!("Fatal error in accept loop: {err}");
        return ExitCode::FAILURE;
    }

    // run() only returns Ok after a signal; wait for the connections to close.
    if signal_thread.join().is_err() {
        eprintln!("Signal listener panicked");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
