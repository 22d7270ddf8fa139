//! Binary entrypoint for the meshgate CLI.
//!
//! Commands:
//! - `start [--dry-run]` - run the gateway loops until Ctrl-C
//! - `init` - write a starter `meshgate.toml`
//! - `status` - print registry counts and broadcast settings as JSON
//! - `nodes` - list every node in the registry
//! - `activity [--minutes <n>]` - list nodes heard recently
//!
//! See the library crate docs for module-level details: `meshgate::`.
use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

use meshgate::config::{Config, ConfigHandle};
use meshgate::gateway::Gateway;
use meshgate::meshtastic::{format_node_id, DisconnectedRadio, MockRadio, RadioTransport};
use meshgate::storage::NodeStore;

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Field gateway for a Meshtastic repeater node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshgate.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Use an in-memory radio that only logs what would be sent
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show registry counts and broadcast settings
    Status,
    /// List all known nodes
    Nodes,
    /// List nodes heard within the activity window
    Activity {
        /// Window in minutes (defaults to the configured `/users` window)
        #[arg(short, long)]
        minutes: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        init_logging(&None, cli.verbose);
        if Path::new(&cli.config).exists() && !force {
            return Err(anyhow!(
                "{} already exists (use --force to overwrite)",
                cli.config
            ));
        }
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Start { dry_run } => {
            info!("Starting meshgate v{}", env!("CARGO_PKG_VERSION"));
            let transport: Arc<dyn RadioTransport> = if dry_run {
                info!("Dry run: radio sends are recorded, not transmitted");
                Arc::new(MockRadio::new())
            } else {
                warn!(
                    "No radio transport attached for {}; gateway runs without a device",
                    config.meshtastic.port
                );
                Arc::new(DisconnectedRadio)
            };
            let gateway = Arc::new(Gateway::open(ConfigHandle::new(config), transport)?);

            // Held for the lifetime of the process; a transport integration feeds packets here.
            let (_packet_tx, packet_rx) = tokio::sync::mpsc::unbounded_channel();

            let stopper = gateway.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutdown requested");
                        stopper.shutdown();
                    }
                    Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
                }
            });

            gateway.clone().run(packet_rx).await?;
            let snapshot = gateway.metrics().snapshot();
            info!("Final counters: {}", serde_json::to_string(&snapshot)?);
        }
        Commands::Status => {
            let store = open_store(&config)?;
            let window = config.gateway.active_window_minutes;
            let since = Utc::now() - chrono::Duration::minutes(i64::from(window));
            let active = store.active_node_numbers(since, Utc::now())?;
            let payload = serde_json::json!({
                "gateway": config.gateway.name,
                "database": config.gateway.database_path,
                "nodes": store.node_count(),
                "activity_entries": store.activity_count(),
                "active_nodes": active.len(),
                "active_window_minutes": window,
                "broadcast_enabled": config.broadcast.enabled,
                "broadcast_interval_secs": config.broadcast.interval_secs,
                "emergency_enabled": config.emergency.enabled,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Nodes => {
            let store = open_store(&config)?;
            for node in store.list_nodes()? {
                println!(
                    "{:<12} {:<6} {:<24} {:<16} last update {}",
                    node.node_id,
                    node.short_name,
                    node.long_name,
                    node.hardware_model,
                    node.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Activity { minutes } => {
            let store = open_store(&config)?;
            let window = minutes.unwrap_or(config.gateway.active_window_minutes);
            let now = Utc::now();
            let since = now - chrono::Duration::minutes(i64::from(window));
            for num in store.active_node_numbers(since, now)? {
                match store.get_node(num)? {
                    Some(node) => println!("{:<12} {}", node.node_id, node.display_name()),
                    None => println!("{:<12} (no identity yet)", format_node_id(num)),
                }
            }
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<NodeStore> {
    let path = &config.gateway.database_path;
    NodeStore::open(path).map_err(|e| anyhow!("Failed to open node database {}: {}", path, e))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    let file = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Under a service manager stdout is not a terminal; the file is enough there
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
